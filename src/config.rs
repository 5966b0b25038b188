//! Analysis configuration storage.
//!
//! Per-detector settings (dark calibration file, rebin factor) live in a
//! JSON file inside a configurable root directory. The configuration is an
//! explicit struct handed to whoever needs it; nothing reads it through a
//! global.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings for one detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Software rebin factor applied to the corrected frame
    pub rebin_factor: u32,
    /// Path of the dark calibration file for this detector
    pub darkcal_path: PathBuf,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            rebin_factor: 1,
            darkcal_path: PathBuf::from("darkcal.darkcal"),
        }
    }
}

/// Analysis settings for all detectors in the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub detectors: Vec<DetectorConfig>,
}

impl AnalysisConfig {
    /// Configuration with default settings for `count` detectors.
    pub fn with_detectors(count: usize) -> Self {
        Self {
            detectors: vec![DetectorConfig::default(); count],
        }
    }

    /// Grow the detector list with default entries to cover `count`
    /// detectors; existing entries are untouched.
    pub fn ensure_detectors(&mut self, count: usize) {
        while self.detectors.len() < count {
            self.detectors.push(DetectorConfig::default());
        }
    }
}

/// Configuration file manager rooted at one directory.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Storage under the user's home directory (`~/.pnccd_analysis`).
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        Ok(Self {
            root_path: PathBuf::from(home).join(".pnccd_analysis"),
        })
    }

    /// Storage under an explicit root directory.
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn config_path(&self) -> PathBuf {
        self.root_path.join("analysis_config.json")
    }

    /// Load the analysis configuration.
    ///
    /// Returns None if no configuration exists yet.
    /// Returns Some(Err) if the file exists but cannot be parsed.
    pub fn load(&self) -> Option<Result<AnalysisConfig, std::io::Error>> {
        let path = self.config_path();
        if !path.exists() {
            return None;
        }
        Some(std::fs::read_to_string(&path).and_then(|json| {
            serde_json::from_str(&json)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        }))
    }

    /// Save the analysis configuration, creating the root directory if
    /// needed. Returns the path written.
    pub fn save(&self, config: &AnalysisConfig) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.root_path)?;
        let path = self.config_path();
        let json = serde_json::to_string_pretty(config)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".pnccd_analysis")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::with_detectors(2);
        assert_eq!(config.detectors.len(), 2);
        assert_eq!(config.detectors[0].rebin_factor, 1);
        assert_eq!(
            config.detectors[1].darkcal_path,
            PathBuf::from("darkcal.darkcal")
        );
    }

    #[test]
    fn test_ensure_detectors_grows_only() {
        let mut config = AnalysisConfig::with_detectors(1);
        config.detectors[0].rebin_factor = 4;
        config.ensure_detectors(3);
        assert_eq!(config.detectors.len(), 3);
        assert_eq!(config.detectors[0].rebin_factor, 4);

        config.ensure_detectors(2);
        assert_eq!(config.detectors.len(), 3);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("config"));

        let mut config = AnalysisConfig::with_detectors(2);
        config.detectors[1].rebin_factor = 2;
        config.detectors[1].darkcal_path = PathBuf::from("/data/run42.darkcal");

        let path = storage.save(&config).unwrap();
        assert!(path.exists());

        let loaded = storage.load().expect("config exists").unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_config_is_none() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("nothing"));
        assert!(storage.load().is_none());
    }

    #[test]
    fn test_load_unparsable_config_is_an_error() {
        let dir = TempDir::new().unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());
        std::fs::write(dir.path().join("analysis_config.json"), "not json").unwrap();
        assert!(storage.load().expect("config exists").is_err());
    }
}
