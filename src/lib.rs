//! Dark-frame calibration and per-frame signal extraction for pnCCD detectors.
//!
//! This crate turns raw pnCCD pixel streams into calibrated, event-classified
//! frames. It covers three pieces of machinery:
//!
//! - **Dark-frame calibration**: an iterative statistical procedure that
//!   derives per-pixel offset, noise sigma and bad-pixel flags from a set of
//!   zero-signal frames, with per-line common-mode correction folded into
//!   every pass ([`calibrate`]).
//! - **Signal extraction**: per-line common-mode subtraction and threshold
//!   comparison on live frames, producing a corrected frame and a photon-hit
//!   list ([`process`]).
//! - **Pixel rearrangement**: the geometric transform that maps physically
//!   segmented sensor quadrants into the logical detector image
//!   ([`rearrange`]).
//!
//! Calibration results persist through the binary statistics-map format in
//! [`store`], and [`analysis`] composes everything into a per-detector façade
//! with software rebinning. The surrounding acquisition pipeline (event
//! dispatch, datagram parsing, output files, display) lives elsewhere and
//! only exchanges frame buffers and hit lists with this crate.

pub mod analysis;
pub mod bad_pixel_map;
pub mod calibrate;
pub mod common_mode;
pub mod config;
pub mod frame;
pub mod geometry;
pub mod pixel_stats;
pub mod process;
pub mod rearrange;
pub mod store;
pub mod synthetic;

pub use analysis::{DetectorFrame, FrameAnalysis};
pub use bad_pixel_map::{BadPixelFlag, BadPixelMap};
pub use calibrate::{CalibrationInfo, CalibrationParams, DarkFrameCalibrator};
pub use common_mode::{CommonModeEstimator, IterativeThreshold, LowestValues};
pub use frame::FrameMeta;
pub use geometry::FrameShape;
pub use pixel_stats::{PixelStat, PixelStatMap};
pub use process::{PhotonHit, SignalFrameProcessor};
pub use rearrange::{PixelRearranger, RearrangementStep, RotationQuadrant};
pub use store::CalibrationStore;
