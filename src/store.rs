//! Binary persistence for dark-frame calibration results.
//!
//! Calibration output is stored in a flat binary format: a fixed 1024-byte
//! header carrying a magic string and the frame geometry, followed by the
//! raw per-pixel statistics entries and the bad-pixel flag bytes. The store
//! keeps a local copy of whatever it has set or loaded and regenerates the
//! derived offset and noise maps from it.

use crate::bad_pixel_map::BadPixelMap;
use crate::geometry::FrameShape;
use crate::pixel_stats::{PixelStat, PixelStatMap};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Magic string opening every statistics-map file, NUL-padded to 24 bytes.
const MAGIC: &[u8; 24] = b"HE pixel statistics map\0";
/// Total header size in bytes.
const HEADER_SIZE: usize = 1024;
/// Zero padding between the geometry words and the statistics block.
const HEADER_PADDING: usize = HEADER_SIZE - MAGIC.len() - 3 * 4;

/// Errors from reading or writing calibration files.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no calibration data has been set")]
    NotLoaded,
    #[error("statistics and bad-pixel maps have different geometries ({stats} vs {bad_pixels})")]
    ShapeMismatch {
        stats: FrameShape,
        bad_pixels: FrameShape,
    },
    #[error("{0} already contains a pixel statistics map and overwrite is not set")]
    WouldOverwrite(PathBuf),
    #[error("{path} is not a valid pixel statistics map: {reason}")]
    CorruptFile { path: PathBuf, reason: String },
}

/// Holder for one detector's persisted calibration data.
///
/// Storage is reallocated only when the geometry of incoming data differs
/// from what is already held. A failed load leaves previously held data
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct CalibrationStore {
    shape: FrameShape,
    stats: PixelStatMap,
    bad_map: BadPixelMap,
    offset_map: Vec<f64>,
    noise_map: Vec<f64>,
}

impl CalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once calibration data has been set or loaded.
    pub fn is_loaded(&self) -> bool {
        self.shape.pixel_count() > 0
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn pixel_stats(&self) -> &PixelStatMap {
        &self.stats
    }

    pub fn bad_pixel_map(&self) -> &BadPixelMap {
        &self.bad_map
    }

    /// Per-pixel offset view, regenerated on every set or load.
    pub fn offset_map(&self) -> &[f64] {
        &self.offset_map
    }

    /// Per-pixel noise view, regenerated on every set or load.
    pub fn noise_map(&self) -> &[f64] {
        &self.noise_map
    }

    /// Copy calibration results into the store.
    ///
    /// The two maps must agree on a non-empty geometry. Local storage is
    /// reused unless the geometry changed; the offset and noise views are
    /// rebuilt.
    pub fn set_calibration(
        &mut self,
        stats: &PixelStatMap,
        bad_map: &BadPixelMap,
    ) -> Result<(), StoreError> {
        if stats.shape() != bad_map.shape() {
            return Err(StoreError::ShapeMismatch {
                stats: stats.shape(),
                bad_pixels: bad_map.shape(),
            });
        }
        if stats.shape().pixel_count() == 0 {
            return Err(StoreError::NotLoaded);
        }
        self.shape = stats.shape();
        self.stats.clone_from(stats);
        self.bad_map.clone_from(bad_map);
        self.rebuild_derived_maps();
        Ok(())
    }

    /// Write the held calibration to a file.
    ///
    /// Refuses to replace a file that already contains a statistics map
    /// unless `overwrite` is set; anything else at the path is truncated.
    pub fn write_to_file(&self, path: &Path, overwrite: bool) -> Result<(), StoreError> {
        if !self.is_loaded() {
            return Err(StoreError::NotLoaded);
        }
        if !overwrite && path.exists() {
            let mut intro = [0u8; MAGIC.len()];
            let mut file = File::open(path)?;
            let n = file.read(&mut intro)?;
            if n >= MAGIC.len() - 1 && intro.starts_with(b"HE pixel statistics") {
                return Err(StoreError::WouldOverwrite(path.to_path_buf()));
            }
        }

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&(self.shape.width as u32).to_le_bytes())?;
        writer.write_all(&(self.shape.height as u32).to_le_bytes())?;
        writer.write_all(&(self.shape.pixel_count() as u32).to_le_bytes())?;
        writer.write_all(&[0u8; HEADER_PADDING])?;
        writer.write_all(bytemuck::cast_slice(self.stats.entries()))?;
        writer.write_all(&self.bad_map.to_bytes())?;
        writer.flush()?;
        info!(path = %path.display(), shape = %self.shape, "calibration written");
        Ok(())
    }

    /// Load a calibration from a file.
    ///
    /// Validates the magic string and that `width * height` matches the
    /// declared length before touching local storage; on any failure the
    /// previously held calibration remains in place.
    pub fn read_from_file(&mut self, path: &Path) -> Result<(), StoreError> {
        let corrupt = |reason: &str| StoreError::CorruptFile {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let mut reader = BufReader::new(File::open(path)?);
        let mut header = [0u8; HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .map_err(|_| corrupt("file shorter than the 1024-byte header"))?;
        if !header[..MAGIC.len()].starts_with(b"HE pixel statistics map") {
            return Err(corrupt("missing magic string"));
        }

        let word = |offset: usize| {
            u32::from_le_bytes([
                header[offset],
                header[offset + 1],
                header[offset + 2],
                header[offset + 3],
            ])
        };
        let width = word(24) as usize;
        let height = word(28) as usize;
        let length = word(32) as usize;
        debug!(width, height, length, "reading calibration header");
        if width == 0 || height == 0 || width * height != length {
            return Err(corrupt("array size information is not consistent"));
        }
        let shape = FrameShape::new(width, height);

        // Read both blocks into fresh storage first so a short or invalid
        // file cannot clobber a previously loaded calibration.
        let mut stats = vec![PixelStat::default(); length];
        reader
            .read_exact(bytemuck::cast_slice_mut(&mut stats))
            .map_err(|_| corrupt("truncated statistics block"))?;
        let mut flag_bytes = vec![0u8; length];
        reader
            .read_exact(&mut flag_bytes)
            .map_err(|_| corrupt("truncated bad-pixel block"))?;
        let bad_map = BadPixelMap::from_bytes(shape, &flag_bytes)
            .ok_or_else(|| corrupt("unknown bad-pixel flag value"))?;
        let stats = PixelStatMap::from_entries(shape, stats)
            .expect("statistics block length was validated against the geometry");

        self.shape = shape;
        self.stats = stats;
        self.bad_map = bad_map;
        self.rebuild_derived_maps();
        info!(path = %path.display(), shape = %self.shape, "calibration loaded");
        Ok(())
    }

    fn rebuild_derived_maps(&mut self) {
        self.offset_map = self.stats.offset_map();
        self.noise_map = self.stats.noise_map();
    }
}
