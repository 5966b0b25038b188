//! Per-detector frame analysis façade.
//!
//! Wires the calibration store, the signal frame processor and the pixel
//! rearranger together: load a dark calibration once, then feed raw
//! detector frames through common-mode correction, hit extraction and the
//! geometric resort into the logical image, with optional software
//! rebinning of the result.

use crate::geometry::FrameShape;
use crate::process::{PhotonHit, ProcessError, SignalFrameProcessor};
use crate::rearrange::{PixelRearranger, RearrangeError, RearrangementStep, RotationQuadrant};
use crate::store::{CalibrationStore, StoreError};
use ndarray::{Array2, ArrayView2};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Errors from the frame-analysis façade.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Rearrange(#[from] RearrangeError),
    #[error("no valid dark calibration is loaded")]
    CalibrationMissing,
    #[error(
        "detector geometry {columns}x{rows} is inconsistent with the calibration geometry {calibration}"
    )]
    DetectorGeometryMismatch {
        columns: usize,
        rows: usize,
        calibration: FrameShape,
    },
    #[error("raw frame holds {found} pixels, expected {expected}")]
    RawBufferMismatch { expected: usize, found: usize },
}

/// Frame buffers and analysis results of one detector for one event.
///
/// The raw frame arrives from the acquisition layer; processing fills the
/// corrected frame, the photon hits, the integral and the calibrated flag.
/// `rows`/`columns` describe the current corrected frame and shrink when it
/// is rebinned; the original dimensions stay untouched.
#[derive(Debug, Clone, Default)]
pub struct DetectorFrame {
    /// Raw pixel buffer in readout order
    pub raw_frame: Vec<i16>,
    /// Corrected frame in logical image order
    pub corrected_frame: Vec<i16>,
    /// Photon hits found in this frame, in calibration-geometry coordinates
    pub photon_hits: Vec<PhotonHit>,
    /// Logical image columns before rebinning
    pub original_columns: usize,
    /// Logical image rows before rebinning
    pub original_rows: usize,
    /// Current corrected-frame columns
    pub columns: usize,
    /// Current corrected-frame rows
    pub rows: usize,
    /// Sum of all corrected-frame pixels
    pub integral: i64,
    /// True once the frame went through a loaded calibration
    pub calibrated: bool,
}

impl DetectorFrame {
    /// Wrap a raw buffer with its logical image dimensions.
    pub fn new(raw_frame: Vec<i16>, columns: usize, rows: usize) -> Self {
        Self {
            raw_frame,
            corrected_frame: Vec::new(),
            photon_hits: Vec::new(),
            original_columns: columns,
            original_rows: rows,
            columns,
            rows,
            integral: 0,
            calibrated: false,
        }
    }

    /// Reset the per-event results, keeping the buffers allocated.
    pub fn clear_results(&mut self) {
        self.photon_hits.clear();
        self.corrected_frame.fill(0);
        self.columns = self.original_columns;
        self.rows = self.original_rows;
        self.integral = 0;
        self.calibrated = false;
    }
}

/// Raw readout geometry of two CFEL pnCCD modules.
const CFEL_RAW_SHAPE: FrameShape = FrameShape {
    width: 2048,
    height: 512,
};
/// Logical image geometry of two CFEL pnCCD modules.
const CFEL_IMAGE_SHAPE: FrameShape = FrameShape {
    width: 1024,
    height: 1024,
};

/// The quadrant resort for two CFEL pnCCD modules: four 512x512 segments,
/// each rotated into its place in the 1024x1024 logical image.
fn cfel_rearranger() -> PixelRearranger {
    let segment = FrameShape::new(512, 512);
    let steps = [
        ((0, 0), (512, 0), RotationQuadrant::Clockwise270),
        ((512, 0), (0, 0), RotationQuadrant::Clockwise90),
        ((1024, 0), (0, 512), RotationQuadrant::Clockwise90),
        ((1536, 0), (512, 512), RotationQuadrant::Clockwise270),
    ];
    let mut rearranger = PixelRearranger::new(CFEL_RAW_SHAPE, CFEL_IMAGE_SHAPE)
        .expect("CFEL geometries hold the same pixel count");
    for (source_pivot, target_pivot, rotation) in steps {
        rearranger
            .add_step(RearrangementStep::new(
                segment,
                source_pivot,
                target_pivot,
                rotation,
            ))
            .expect("CFEL resort steps are statically in bounds");
    }
    rearranger
}

/// Turns raw detector frames into corrected frames plus photon-hit lists.
pub struct FrameAnalysis {
    store: CalibrationStore,
    processor: SignalFrameProcessor,
    rearranger: PixelRearranger,
    number_of_adcs: usize,
    scratch: Array2<i16>,
    calibration_ok: bool,
}

impl FrameAnalysis {
    /// Analysis configured for two CFEL pnCCD modules with default event
    /// selection (4 sigma, two rejection iterations).
    pub fn new() -> Self {
        Self::with_rearranger(cfel_rearranger(), 1, 4.0, 2)
    }

    /// Analysis with an explicit resort geometry and event selection.
    ///
    /// # Arguments
    /// * `rearranger` - resort from calibration geometry to image geometry
    /// * `number_of_adcs` - line segmentation for common-mode estimation
    /// * `threshold_multiplier` - event threshold in noise sigmas
    /// * `depth` - common-mode event-rejection iterations on data frames
    pub fn with_rearranger(
        rearranger: PixelRearranger,
        number_of_adcs: usize,
        threshold_multiplier: f64,
        depth: usize,
    ) -> Self {
        Self {
            store: CalibrationStore::new(),
            processor: SignalFrameProcessor::new(threshold_multiplier, depth),
            rearranger,
            number_of_adcs,
            scratch: Array2::zeros((0, 0)),
            calibration_ok: false,
        }
    }

    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibration_ok
    }

    /// Load a dark calibration file and wire its maps into the signal
    /// processor. A failed load disables frame processing until a load
    /// succeeds.
    pub fn load_dark_calibration(&mut self, path: &Path) -> Result<(), AnalysisError> {
        self.calibration_ok = false;
        if let Err(error) = self.store.read_from_file(path) {
            warn!(path = %path.display(), %error, "dark calibration load failed");
            self.processor.clear_calibration();
            return Err(error.into());
        }
        self.processor
            .load_calibration(self.store.pixel_stats(), self.store.bad_pixel_map());
        self.scratch = Array2::zeros(self.store.shape().to_dim());
        self.calibration_ok = true;
        info!(shape = %self.store.shape(), "dark calibration ready");
        Ok(())
    }

    /// Process one detector frame.
    ///
    /// Checks the detector geometry against the loaded calibration, runs
    /// common-mode correction and hit extraction, resorts the corrected
    /// pixels into the logical image and computes the frame integral. Hits
    /// are appended to the detector's list in calibration-geometry
    /// coordinates.
    pub fn process_detector_frame(
        &mut self,
        detector: &mut DetectorFrame,
    ) -> Result<(), AnalysisError> {
        if !self.calibration_ok {
            return Err(AnalysisError::CalibrationMissing);
        }
        let calibration = self.store.shape();

        // The logical image folds the two modules on top of each other:
        // twice the columns and half the rows of the calibration geometry.
        if detector.original_columns * 2 != calibration.width
            || detector.original_rows / 2 != calibration.height
        {
            return Err(AnalysisError::DetectorGeometryMismatch {
                columns: detector.original_columns,
                rows: detector.original_rows,
                calibration,
            });
        }
        if detector.raw_frame.len() != calibration.pixel_count() {
            return Err(AnalysisError::RawBufferMismatch {
                expected: calibration.pixel_count(),
                found: detector.raw_frame.len(),
            });
        }

        let raw = ArrayView2::from_shape(calibration.to_dim(), &detector.raw_frame)
            .expect("raw buffer length was validated against the geometry");
        self.processor.process(
            &raw,
            self.number_of_adcs,
            &mut self.scratch,
            &mut detector.photon_hits,
        )?;

        detector
            .corrected_frame
            .resize(calibration.pixel_count(), 0);
        let scratch = self
            .scratch
            .as_slice()
            .expect("scratch frame uses standard row-major layout");
        self.rearranger
            .rearrange_all(scratch, &mut detector.corrected_frame)?;

        detector.columns = detector.original_columns;
        detector.rows = detector.original_rows;
        detector.integral = detector
            .corrected_frame
            .iter()
            .map(|&v| i64::from(v))
            .sum();
        detector.calibrated = true;
        Ok(())
    }

    /// Rebin the corrected frame by summing `factor x factor` pixel blocks.
    ///
    /// A factor that does not divide the current row count is coerced to
    /// the next smaller power of two. Returns the factor actually applied.
    pub fn rebin_corrected_frame(detector: &mut DetectorFrame, factor: u32) -> u32 {
        let mut factor = factor.max(1) as usize;
        if factor == 1 {
            return 1;
        }
        if detector.rows % factor != 0 {
            let mut coerced = 1;
            while coerced * 2 <= factor {
                coerced *= 2;
            }
            warn!(requested = factor, coerced, "rebin factor coerced");
            factor = coerced;
        }
        if factor == 1 {
            return 1;
        }

        let old_columns = detector.columns;
        let new_rows = detector.rows / factor;
        let new_columns = detector.columns / factor;
        if new_rows == 0 || new_columns == 0 {
            warn!(factor, "rebin factor exceeds the frame geometry, skipped");
            return 1;
        }
        let mut rebinned = vec![0i16; new_rows * new_columns];
        for (row, chunk) in rebinned.chunks_mut(new_columns).enumerate() {
            for (col, out) in chunk.iter_mut().enumerate() {
                let mut sum = 0i32;
                for dy in 0..factor {
                    for dx in 0..factor {
                        let src = (row * factor + dy) * old_columns + col * factor + dx;
                        sum += i32::from(detector.corrected_frame[src]);
                    }
                }
                *out = sum.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
            }
        }

        detector.corrected_frame = rebinned;
        detector.rows = new_rows;
        detector.columns = new_columns;
        factor as u32
    }
}

impl Default for FrameAnalysis {
    fn default() -> Self {
        Self::new()
    }
}
