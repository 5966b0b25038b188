//! Iterative dark-frame calibration.
//!
//! Calibration evaluates per-pixel statistics over a set of dark frames and
//! converts them into the offset level, noise sigma, bad-pixel flag and
//! event threshold of every pixel. It is a converging iterative procedure:
//! each pass re-estimates the per-line common mode with an increasing event
//! rejection depth, re-accumulates the statistics over the whole frame set
//! and re-derives the per-pixel values, until the mean noise sigma settles.
//! A bad-pixel map built from the converged statistics feeds a second round
//! of passes that excludes the flagged pixels.

use crate::bad_pixel_map::{BadPixelFlag, BadPixelMap};
use crate::common_mode::{CommonModeEstimator, IterativeThreshold};
use crate::frame::FrameMeta;
use crate::geometry::FrameShape;
use crate::pixel_stats::PixelStatMap;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Relative mean-sigma change below which a calibration phase stops.
const SIGMA_CONVERGENCE: f64 = 0.002;
/// Relative mean-sigma change below which the bad-pixel map is rebuilt
/// during the post-bad-map phase.
const SIGMA_REBUILD: f64 = 0.005;
/// Guard against a mean sigma that grew between passes.
const SIGMA_INCREASE_GUARD: f64 = -1e-6;

/// Recorded common-mode value for a line that had to be skipped.
const CMODE_INVALID: i16 = -1;

/// Errors from dark-frame calibration.
#[derive(Error, Debug)]
pub enum CalibError {
    #[error("parameter {0} is outside its valid range")]
    InvalidParameter(&'static str),
    #[error("calibration needs at least 2 frames, got {0}")]
    InsufficientFrames(usize),
    #[error("frame {index} has geometry {found} but the set started with {expected}")]
    FrameGeometryMismatch {
        index: usize,
        expected: FrameShape,
        found: FrameShape,
    },
    #[error("frame set has {frames} frames but {metas} metadata entries")]
    MetadataMismatch { frames: usize, metas: usize },
    #[error("calibration already done and no reset was requested")]
    AlreadyCalibrated,
}

/// Which event-threshold multiplier a threshold map is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdKind {
    /// Multiplier used while calibrating (event rejection inside passes)
    Calibration,
    /// Multiplier used for photon-hit selection on data frames
    Event,
}

/// Tunable calibration parameters.
///
/// Every setter validates its range and leaves the prior value unchanged on
/// rejection. Defaults match the values the analysis has always started
/// from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationParams {
    empty_pixel_cut: u32,
    max_events_in_frame: usize,
    num_iter_before: usize,
    num_iter_after: usize,
    max_pixel_sigma: f64,
    min_pixel_sigma: f64,
    saturation_cut: f64,
    calib_event_threshold: f64,
    event_threshold: f64,
    number_of_adcs: usize,
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self {
            empty_pixel_cut: 90,
            max_events_in_frame: 200,
            num_iter_before: 4,
            num_iter_after: 5,
            max_pixel_sigma: 32.0,
            min_pixel_sigma: 1.0,
            saturation_cut: 3000.0,
            calib_event_threshold: 4.0,
            event_threshold: 4.0,
            number_of_adcs: 1,
        }
    }
}

impl CalibrationParams {
    /// Maximum allowed noise sigma before a pixel is flagged noisy.
    pub fn set_max_pixel_sigma(&mut self, value: f64) -> Result<(), CalibError> {
        if value < 1.0 {
            return Err(CalibError::InvalidParameter("max_pixel_sigma"));
        }
        self.max_pixel_sigma = value;
        Ok(())
    }

    pub fn max_pixel_sigma(&self) -> f64 {
        self.max_pixel_sigma
    }

    /// Minimum allowed noise sigma before a pixel is flagged cold.
    pub fn set_min_pixel_sigma(&mut self, value: f64) -> Result<(), CalibError> {
        if value < 0.0 {
            return Err(CalibError::InvalidParameter("min_pixel_sigma"));
        }
        self.min_pixel_sigma = value;
        Ok(())
    }

    pub fn min_pixel_sigma(&self) -> f64 {
        self.min_pixel_sigma
    }

    /// Maximum allowed mean ADC value before a pixel counts as saturated.
    pub fn set_saturation_cut(&mut self, value: f64) -> Result<(), CalibError> {
        if value < 1.0 {
            return Err(CalibError::InvalidParameter("saturation_cut"));
        }
        self.saturation_cut = value;
        Ok(())
    }

    pub fn saturation_cut(&self) -> f64 {
        self.saturation_cut
    }

    /// Minimum number of accepted values per pixel across the frame set.
    pub fn set_empty_pixel_cut(&mut self, value: u32) -> Result<(), CalibError> {
        if value < 2 {
            return Err(CalibError::InvalidParameter("empty_pixel_cut"));
        }
        self.empty_pixel_cut = value;
        Ok(())
    }

    pub fn empty_pixel_cut(&self) -> u32 {
        self.empty_pixel_cut
    }

    /// Event count per calibration frame above which a warning is logged.
    pub fn set_max_events_in_frame(&mut self, value: usize) -> Result<(), CalibError> {
        self.max_events_in_frame = value;
        Ok(())
    }

    pub fn max_events_in_frame(&self) -> usize {
        self.max_events_in_frame
    }

    /// Event threshold multiplier used during calibration passes.
    pub fn set_calib_event_threshold(&mut self, value: f64) -> Result<(), CalibError> {
        if value < 0.1 {
            return Err(CalibError::InvalidParameter("calib_event_threshold"));
        }
        self.calib_event_threshold = value;
        Ok(())
    }

    pub fn calib_event_threshold(&self) -> f64 {
        self.calib_event_threshold
    }

    /// Event threshold multiplier used for photon-hit selection.
    pub fn set_event_threshold(&mut self, value: f64) -> Result<(), CalibError> {
        if value < 0.1 {
            return Err(CalibError::InvalidParameter("event_threshold"));
        }
        self.event_threshold = value;
        Ok(())
    }

    pub fn event_threshold(&self) -> f64 {
        self.event_threshold
    }

    /// Number of calibration passes before the bad-pixel map is built.
    pub fn set_num_iter_before(&mut self, value: usize) -> Result<(), CalibError> {
        if value < 1 {
            return Err(CalibError::InvalidParameter("num_iter_before"));
        }
        self.num_iter_before = value;
        Ok(())
    }

    pub fn num_iter_before(&self) -> usize {
        self.num_iter_before
    }

    /// Number of calibration passes after the bad-pixel map is built.
    pub fn set_num_iter_after(&mut self, value: usize) -> Result<(), CalibError> {
        if value < 1 {
            return Err(CalibError::InvalidParameter("num_iter_after"));
        }
        self.num_iter_after = value;
        Ok(())
    }

    pub fn num_iter_after(&self) -> usize {
        self.num_iter_after
    }

    /// Number of ADCs reading the frame; each line splits into this many
    /// common-mode segments.
    pub fn set_number_of_adcs(&mut self, value: usize) -> Result<(), CalibError> {
        if value < 1 {
            return Err(CalibError::InvalidParameter("number_of_adcs"));
        }
        self.number_of_adcs = value;
        Ok(())
    }

    pub fn number_of_adcs(&self) -> usize {
        self.number_of_adcs
    }
}

/// Scalar summary of one calibration run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationInfo {
    /// Index of the first calibration frame
    pub first_frame: u32,
    /// Index of the last calibration frame
    pub last_frame: u32,
    /// Pixels flagged cold (sigma below minimum)
    pub n_bad_cold: usize,
    /// Pixels flagged noisy (sigma above maximum)
    pub n_bad_noisy: usize,
    /// Pixels flagged empty (too few accepted values)
    pub n_bad_empty: usize,
    /// Pixels flagged saturated (mean above the cut)
    pub n_bad_satur: usize,
    /// Event hits rejected during the final pass
    pub n_events: usize,
    /// Calibration frames rejected during the final pass
    pub n_rejected_frames: usize,
    /// Mean noise sigma over pixels with statistics
    pub mean_sigma: f64,
    /// Mean offset over pixels with statistics
    pub mean_offset: f64,
    /// Capture time (seconds) of the last calibration frame
    pub start_time: u32,
}

/// Dark-frame calibration engine for one detector.
///
/// Owns the per-pixel statistics, bad-pixel map and event-threshold map it
/// produces; callers read them through the accessors after a successful
/// [`calibrate`](Self::calibrate) run.
pub struct DarkFrameCalibrator {
    params: CalibrationParams,
    estimator: Box<dyn CommonModeEstimator>,
    shape: FrameShape,
    stats: PixelStatMap,
    bad_map: BadPixelMap,
    thresh_map: Vec<i16>,
    channel_noise: Vec<f64>,
    raw_line_cmodes: Vec<i16>,
    num_frames: usize,
    num_bad_pixels: usize,
    pass_sigmas: Vec<f64>,
    info: CalibrationInfo,
    calib_done: bool,
}

impl DarkFrameCalibrator {
    /// Create a calibrator with the given parameters and the iterative
    /// threshold common-mode estimator.
    pub fn new(params: CalibrationParams) -> Self {
        Self::with_estimator(params, Box::new(IterativeThreshold))
    }

    /// Create a calibrator with an explicit common-mode strategy.
    pub fn with_estimator(
        params: CalibrationParams,
        estimator: Box<dyn CommonModeEstimator>,
    ) -> Self {
        Self {
            params,
            estimator,
            shape: FrameShape::default(),
            stats: PixelStatMap::default(),
            bad_map: BadPixelMap::default(),
            thresh_map: Vec::new(),
            channel_noise: Vec::new(),
            raw_line_cmodes: Vec::new(),
            num_frames: 0,
            num_bad_pixels: 0,
            pass_sigmas: Vec::new(),
            info: CalibrationInfo::default(),
            calib_done: false,
        }
    }

    /// Run the full calibration over a set of dark frames.
    ///
    /// Frames must be processed in index order; the slice order is taken as
    /// given. `reset` must be passed to recalibrate after a completed run;
    /// user bad-pixel flags survive the reset. On success the offset, noise,
    /// bad-pixel and threshold maps are available through the accessors.
    ///
    /// # Arguments
    /// * `frames` - at least two dark frames of identical geometry
    /// * `metas` - one metadata entry per frame
    /// * `reset` - allow recalibration when a calibration already exists
    pub fn calibrate(
        &mut self,
        frames: &[Array2<i16>],
        metas: &[FrameMeta],
        reset: bool,
    ) -> Result<&CalibrationInfo, CalibError> {
        self.num_bad_pixels = 0;
        if frames.len() < 2 {
            return Err(CalibError::InsufficientFrames(frames.len()));
        }
        if metas.len() != frames.len() {
            return Err(CalibError::MetadataMismatch {
                frames: frames.len(),
                metas: metas.len(),
            });
        }
        if self.calib_done && !reset {
            return Err(CalibError::AlreadyCalibrated);
        }

        let (height, width) = frames[0].dim();
        let shape = FrameShape::new(width, height);
        for (index, frame) in frames.iter().enumerate().skip(1) {
            let (h, w) = frame.dim();
            if (h, w) != (height, width) {
                return Err(CalibError::FrameGeometryMismatch {
                    index,
                    expected: shape,
                    found: FrameShape::new(w, h),
                });
            }
        }
        if width % self.params.number_of_adcs != 0 {
            return Err(CalibError::InvalidParameter("number_of_adcs"));
        }

        self.alloc_resources(shape, frames.len());
        self.info.first_frame = metas[0].index;
        self.info.last_frame = metas[metas.len() - 1].index;
        self.pass_sigmas.clear();

        // First phase: iterate with growing common-mode depth until the
        // mean noise sigma settles.
        let mut depth = 0usize;
        let mut sigma_old = 1e10;
        for pass in 0..self.params.num_iter_before {
            let sigma = self.calibration_pass(frames, metas, depth);
            self.pass_sigmas.push(sigma);
            if pass < 3 || depth % 2 == 1 {
                depth += 1;
            }
            info!(pass, depth, mean_sigma = sigma, "calibration pass done");
            let diff = (sigma_old - sigma) / sigma_old;
            if diff > SIGMA_INCREASE_GUARD && diff < SIGMA_CONVERGENCE {
                break;
            }
            sigma_old = sigma;
        }

        // Build the bad-pixel map from the converged statistics.
        self.num_bad_pixels = self.classify_bad_pixels();
        info!(bad_pixels = self.num_bad_pixels, "bad pixel map built");

        // Second phase, only when bad pixels exist: repeat with the flagged
        // pixels excluded, rebuilding the map as the sigma settles.
        if self.num_bad_pixels > 0 {
            sigma_old = 1e10;
            let mut depth = 0usize;
            let mut diff = 1.0f64;
            for pass in 0..self.params.num_iter_after {
                let sigma = self.calibration_pass(frames, metas, depth);
                self.pass_sigmas.push(sigma);
                if pass < 3 || depth % 2 == 1 {
                    depth += 1;
                }
                info!(pass, depth, mean_sigma = sigma, "post-badmap pass done");
                diff = (sigma_old - sigma) / sigma_old;
                if diff.abs() < SIGMA_REBUILD {
                    self.num_bad_pixels = self.classify_bad_pixels();
                    info!(new_bad = self.num_bad_pixels, "bad pixels added");
                }
                if diff > SIGMA_INCREASE_GUARD
                    && diff < SIGMA_CONVERGENCE
                    && self.num_bad_pixels == 0
                {
                    break;
                }
                sigma_old = sigma;
            }
            // Final rebuild when the last pass had not settled enough to
            // trigger one.
            if diff.abs() >= SIGMA_REBUILD {
                let added = self.classify_bad_pixels();
                info!(new_bad = added, "final bad pixel rebuild");
            }
        }

        self.build_threshold_map(ThresholdKind::Calibration);
        self.compute_channel_noise();
        self.info.start_time = metas[metas.len() - 1].tv_sec;
        self.calib_done = true;
        info!(
            mean_sigma = self.info.mean_sigma,
            mean_offset = self.info.mean_offset,
            "calibration finished"
        );
        Ok(&self.info)
    }

    /// One accumulation pass over the frame set; returns the mean sigma.
    fn calibration_pass(&mut self, frames: &[Array2<i16>], metas: &[FrameMeta], depth: usize) -> f64 {
        let width = self.shape.width;
        let height = self.shape.height;
        let nadcs = self.params.number_of_adcs;
        let adc_channels = width / nadcs;
        let means = self.stats.mean_map();

        self.info.n_events = 0;
        self.info.n_rejected_frames = 0;
        self.info.mean_sigma = 0.0;
        self.info.mean_offset = 0.0;
        self.stats.clear_sums();

        let mut scratch: Vec<i16> = Vec::with_capacity(adc_channels);

        for (frame_idx, frame) in frames.iter().enumerate() {
            let buf = frame
                .as_slice()
                .expect("calibration frames use standard row-major layout");
            // A frame whose pixels are all identical carries no statistics;
            // reject it once event rejection is active.
            if depth > 0 && buf.iter().all(|&v| v == buf[0]) {
                self.info.n_rejected_frames += 1;
                continue;
            }

            // Frames may come with an incomplete last line; skip it.
            let mut frame_height = height;
            if metas[frame_idx].incomplete_last_line {
                frame_height -= 1;
            }

            let mut events_in_frame = 0usize;
            for y in 0..frame_height {
                for adc in 0..nadcs {
                    let seg = y * width + adc * adc_channels;
                    scratch.clear();
                    scratch.extend_from_slice(&buf[seg..seg + adc_channels]);

                    let flags = &self.bad_map.flags()[seg..seg + adc_channels];
                    let cmode = self.estimator.estimate(
                        &mut scratch,
                        &self.thresh_map[seg..seg + adc_channels],
                        flags,
                        &means[seg..seg + adc_channels],
                        depth,
                    );
                    let cmode_idx = adc + nadcs * y + nadcs * height * frame_idx;
                    let Some(cmode) = cmode else {
                        // Too few usable pixels: the whole line segment is
                        // excluded from this pass.
                        self.raw_line_cmodes[cmode_idx] = CMODE_INVALID;
                        continue;
                    };
                    self.raw_line_cmodes[cmode_idx] = cmode;

                    let stats_seg = &mut self.stats.entries_mut()[seg..seg + adc_channels];
                    for (i, stat) in stats_seg.iter_mut().enumerate() {
                        let raw = scratch[i];
                        let corrected = i32::from(raw) - i32::from(cmode);
                        if depth > 0
                            && corrected
                                > i32::from(self.thresh_map[seg + i]) + i32::from(means[seg + i])
                            && !flags[i].is_bad()
                        {
                            self.info.n_events += 1;
                            events_in_frame += 1;
                            continue;
                        }
                        stat.accumulate(raw, corrected as i16);
                    }
                }
            }
            if events_in_frame > self.params.max_events_in_frame {
                warn!(
                    frame = metas[frame_idx].index,
                    events = events_in_frame,
                    limit = self.params.max_events_in_frame,
                    "calibration frame exceeds the event limit"
                );
            }
        }

        // Derive mean, offset, sigma and the in-pass event threshold for
        // every pixel with statistics counts.
        let mut pixel_count = 0usize;
        let mut sigma_sum = 0.0;
        let mut offset_sum = 0.0;
        let Self {
            stats,
            thresh_map,
            params,
            ..
        } = self;
        for (i, stat) in stats.entries_mut().iter_mut().enumerate() {
            if stat.count == 0 {
                continue;
            }
            stat.finalize();
            let threshold = params.calib_event_threshold * stat.sigma;
            thresh_map[i] = if threshold > 1.6e4 {
                16000
            } else {
                threshold.round() as i16
            };
            pixel_count += 1;
            sigma_sum += stat.sigma;
            offset_sum += stat.offset;
        }

        if pixel_count > 0 {
            self.info.mean_sigma = sigma_sum / pixel_count as f64;
            self.info.mean_offset = if pixel_count > self.num_bad_pixels {
                offset_sum / (pixel_count - self.num_bad_pixels) as f64
            } else {
                offset_sum / pixel_count as f64
            };
        }
        self.info.mean_sigma
    }

    /// Classify unflagged pixels from the current statistics and apply the
    /// whole-channel rule; returns the number of newly flagged pixels.
    fn classify_bad_pixels(&mut self) -> usize {
        let mut newly_flagged = 0usize;
        let mut n_empty = 0usize;
        let mut n_satur = 0usize;
        let mut n_noisy = 0usize;
        let mut n_cold = 0usize;

        let Self {
            stats,
            bad_map,
            params,
            ..
        } = self;
        for (stat, flag) in stats.entries().iter().zip(bad_map.flags_mut().iter_mut()) {
            if !flag.is_bad() {
                if stat.count < params.empty_pixel_cut {
                    *flag = BadPixelFlag::Empty;
                    newly_flagged += 1;
                } else if f64::from(stat.mean) > params.saturation_cut {
                    *flag = BadPixelFlag::Satur;
                    newly_flagged += 1;
                } else if stat.sigma > params.max_pixel_sigma {
                    *flag = BadPixelFlag::Noise;
                    newly_flagged += 1;
                } else if stat.sigma < params.min_pixel_sigma {
                    *flag = BadPixelFlag::Cold;
                    newly_flagged += 1;
                }
            }
            match *flag {
                BadPixelFlag::Empty => n_empty += 1,
                BadPixelFlag::Satur => n_satur += 1,
                BadPixelFlag::Noise => n_noisy += 1,
                BadPixelFlag::Cold => n_cold += 1,
                _ => {}
            }
        }
        self.info.n_bad_empty = n_empty;
        self.info.n_bad_satur = n_satur;
        self.info.n_bad_noisy = n_noisy;
        self.info.n_bad_cold = n_cold;

        // A channel with half or more of its pixels already bad is rejected
        // as a whole; user flags do not count toward the limit.
        let width = self.shape.width;
        let height = self.shape.height;
        for x in 0..width {
            let bad_in_channel = (0..height)
                .filter(|&y| {
                    let flag = self.bad_map.flags()[y * width + x];
                    flag.is_bad() && flag != BadPixelFlag::User
                })
                .count();
            if bad_in_channel < height / 2 {
                continue;
            }
            debug!(channel = x, bad_in_channel, "rejecting whole channel");
            for y in 0..height {
                let flag = &mut self.bad_map.flags_mut()[y * width + x];
                if !flag.is_bad() {
                    *flag = BadPixelFlag::Chan;
                }
            }
        }

        newly_flagged
    }

    /// Rebuild the event-threshold map from the current sigmas.
    ///
    /// The threshold is a multiple of the pixel noise sigma, capped at the
    /// signed 16-bit maximum.
    pub fn build_threshold_map(&mut self, kind: ThresholdKind) {
        let multiplier = match kind {
            ThresholdKind::Calibration => self.params.calib_event_threshold,
            ThresholdKind::Event => self.params.event_threshold,
        };
        let Self {
            stats, thresh_map, ..
        } = self;
        for (stat, threshold) in stats.entries().iter().zip(thresh_map.iter_mut()) {
            let value = multiplier * stat.sigma;
            *threshold = if value > 32767.0 {
                32767
            } else {
                value.round() as i16
            };
        }
    }

    /// Mean noise sigma of each readout channel, over all lines.
    fn compute_channel_noise(&mut self) {
        let width = self.shape.width;
        let height = self.shape.height;
        self.channel_noise.fill(0.0);
        for y in 0..height {
            for x in 0..width {
                self.channel_noise[x] += self.stats.entries()[y * width + x].sigma;
            }
        }
        if height > 0 {
            for value in &mut self.channel_noise {
                *value /= height as f64;
            }
        }
        debug!(
            channels = width,
            max = self
                .channel_noise
                .iter()
                .cloned()
                .fold(f64::NEG_INFINITY, f64::max),
            "channel noise computed"
        );
    }

    /// Offset-corrected line common-mode values of the last calibration.
    ///
    /// For every (frame, line, ADC) triple the raw common-mode value
    /// recorded during the final pass is corrected by the mean pixel offset
    /// of that line segment. Returns `None` before any calibration ran.
    /// Layout: `adc + number_of_adcs * (line + height * frame)`.
    pub fn line_common_modes(&self) -> Option<Vec<i16>> {
        if self.raw_line_cmodes.is_empty() {
            return None;
        }
        let width = self.shape.width;
        let height = self.shape.height;
        let nadcs = self.params.number_of_adcs;
        let adc_channels = width / nadcs;
        let offsets = self.stats.offset_map();

        // Mean offset of each line segment.
        let mut line_offsets = vec![0i16; height * nadcs];
        for y in 0..height {
            for adc in 0..nadcs {
                let seg = y * width + adc * adc_channels;
                let sum: f64 = offsets[seg..seg + adc_channels].iter().sum();
                line_offsets[adc + y * nadcs] = (sum / adc_channels as f64).round() as i16;
            }
        }

        let mut corrected = vec![0i16; self.raw_line_cmodes.len()];
        for frame in 0..self.num_frames {
            for y in 0..height {
                for adc in 0..nadcs {
                    let idx = adc + nadcs * y + nadcs * height * frame;
                    corrected[idx] =
                        self.raw_line_cmodes[idx].saturating_sub(line_offsets[adc + y * nadcs]);
                }
            }
        }
        Some(corrected)
    }

    /// Size the result buffers for a new run, reallocating only when the
    /// geometry changed. User bad-pixel flags survive.
    fn alloc_resources(&mut self, shape: FrameShape, num_frames: usize) {
        let pixel_count = shape.pixel_count();
        self.stats.reset(shape);
        self.bad_map.reset(shape);
        if self.thresh_map.len() != pixel_count {
            self.thresh_map = vec![0; pixel_count];
        } else {
            self.thresh_map.fill(0);
        }
        if self.channel_noise.len() != shape.width {
            self.channel_noise = vec![0.0; shape.width];
        }
        let cmode_count = num_frames * shape.height * self.params.number_of_adcs;
        if self.raw_line_cmodes.len() != cmode_count {
            self.raw_line_cmodes = vec![0; cmode_count];
        } else {
            self.raw_line_cmodes.fill(0);
        }
        self.shape = shape;
        self.num_frames = num_frames;
    }

    pub fn params(&self) -> &CalibrationParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut CalibrationParams {
        &mut self.params
    }

    pub fn info(&self) -> &CalibrationInfo {
        &self.info
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn is_calibrated(&self) -> bool {
        self.calib_done
    }

    pub fn pixel_stats(&self) -> &PixelStatMap {
        &self.stats
    }

    pub fn bad_pixel_map(&self) -> &BadPixelMap {
        &self.bad_map
    }

    /// Mutable access to the bad-pixel map, for operator flags.
    pub fn bad_pixel_map_mut(&mut self) -> &mut BadPixelMap {
        &mut self.bad_map
    }

    pub fn event_threshold_map(&self) -> &[i16] {
        &self.thresh_map
    }

    pub fn offset_map(&self) -> Vec<f64> {
        self.stats.offset_map()
    }

    pub fn noise_map(&self) -> Vec<f64> {
        self.stats.noise_map()
    }

    pub fn channel_noise(&self) -> &[f64] {
        &self.channel_noise
    }

    /// Mean noise sigma recorded after each pass of the last calibration.
    pub fn pass_mean_sigmas(&self) -> &[f64] {
        &self.pass_sigmas
    }

    /// Human-readable markdown summary of the last calibration.
    pub fn generate_report(&self) -> String {
        let total_pixels = self.shape.pixel_count();
        let n_bad = self.bad_map.num_bad_pixels();
        let bad_percent = if total_pixels > 0 {
            n_bad as f64 / total_pixels as f64 * 100.0
        } else {
            0.0
        };

        let mut report = String::new();
        report.push_str("# Dark Frame Calibration Report\n\n");
        report.push_str(&format!(
            "Calibrated a {} pixel detector from frames {}..={}.\n\n",
            self.shape, self.info.first_frame, self.info.last_frame
        ));
        report.push_str("## Noise\n\n");
        report.push_str(&format!(
            "- **Mean noise sigma**: {:.3} ADU\n",
            self.info.mean_sigma
        ));
        report.push_str(&format!(
            "- **Mean pixel offset**: {:.2} ADU\n",
            self.info.mean_offset
        ));
        report.push_str(&format!(
            "- **Passes run**: {}\n\n",
            self.pass_sigmas.len()
        ));
        report.push_str("## Bad Pixels\n\n");
        report.push_str(&format!(
            "**Total**: {n_bad} ({bad_percent:.3}% of {total_pixels})\n\n"
        ));
        report.push_str("| Class | Count |\n|-------|-------|\n");
        report.push_str(&format!("| Noisy | {} |\n", self.info.n_bad_noisy));
        report.push_str(&format!("| Cold | {} |\n", self.info.n_bad_cold));
        report.push_str(&format!("| Empty | {} |\n", self.info.n_bad_empty));
        report.push_str(&format!("| Saturated | {} |\n", self.info.n_bad_satur));
        report.push_str(&format!(
            "| Channel | {} |\n",
            self.bad_map.count_of(BadPixelFlag::Chan)
        ));
        report.push_str(&format!(
            "| User | {} |\n\n",
            self.bad_map.count_of(BadPixelFlag::User)
        ));
        report.push_str(&format!(
            "Rejected frames: {}, events rejected in final pass: {}\n",
            self.info.n_rejected_frames, self.info.n_events
        ));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{dark_frame_set, default_metas, sprinkle_events};
    use approx::assert_relative_eq;

    fn quick_params() -> CalibrationParams {
        let mut params = CalibrationParams::default();
        // Synthetic sets are small; every pixel has a value per frame.
        params.set_empty_pixel_cut(2).unwrap();
        params
    }

    #[test]
    fn test_insufficient_frames_leaves_maps_untouched() {
        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        let frames = dark_frame_set(FrameShape::new(16, 8), 100.0, 3.0, 1, 7);
        let metas = default_metas(1);

        let result = calibrator.calibrate(&frames, &metas, false);
        assert!(matches!(result, Err(CalibError::InsufficientFrames(1))));
        assert!(calibrator.pixel_stats().is_empty());
        assert!(calibrator.bad_pixel_map().is_empty());
        assert!(!calibrator.is_calibrated());
    }

    #[test]
    fn test_metadata_mismatch_is_rejected() {
        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        let frames = dark_frame_set(FrameShape::new(16, 8), 100.0, 3.0, 4, 7);
        let metas = default_metas(3);
        assert!(matches!(
            calibrator.calibrate(&frames, &metas, false),
            Err(CalibError::MetadataMismatch { .. })
        ));
    }

    #[test]
    fn test_basic_calibration_recovers_offset_and_sigma() {
        let shape = FrameShape::new(32, 16);
        let frames = dark_frame_set(shape, 200.0, 4.0, 30, 42);
        let metas = default_metas(30);

        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        let info = calibrator.calibrate(&frames, &metas, false).unwrap().clone();

        // The offset is the raw mean; the common mode shifts the corrected
        // mean toward zero, not the offset.
        assert_relative_eq!(info.mean_offset, 200.0, epsilon = 3.0);
        assert_relative_eq!(info.mean_sigma, 4.0, epsilon = 1.0);
        assert_eq!(info.first_frame, 0);
        assert_eq!(info.last_frame, 29);
        assert_eq!(info.n_rejected_frames, 0);
    }

    #[test]
    fn test_geometry_invariant_of_all_maps() {
        let shape = FrameShape::new(32, 16);
        let frames = dark_frame_set(shape, 150.0, 3.0, 10, 3);
        let metas = default_metas(10);

        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        calibrator.calibrate(&frames, &metas, false).unwrap();

        let count = shape.pixel_count();
        assert_eq!(calibrator.pixel_stats().entries().len(), count);
        assert_eq!(calibrator.bad_pixel_map().flags().len(), count);
        assert_eq!(calibrator.offset_map().len(), count);
        assert_eq!(calibrator.noise_map().len(), count);
        assert_eq!(calibrator.event_threshold_map().len(), count);
    }

    #[test]
    fn test_recalibration_requires_reset() {
        let shape = FrameShape::new(16, 16);
        let frames = dark_frame_set(shape, 120.0, 3.0, 8, 11);
        let metas = default_metas(8);

        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        calibrator.calibrate(&frames, &metas, false).unwrap();
        assert!(matches!(
            calibrator.calibrate(&frames, &metas, false),
            Err(CalibError::AlreadyCalibrated)
        ));
        assert!(calibrator.calibrate(&frames, &metas, true).is_ok());
    }

    #[test]
    fn test_user_flags_are_sticky_across_recalibration() {
        let shape = FrameShape::new(16, 16);
        let frames = dark_frame_set(shape, 120.0, 3.0, 8, 5);
        let metas = default_metas(8);

        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        calibrator.calibrate(&frames, &metas, false).unwrap();
        calibrator.bad_pixel_map_mut().set_user_flag(3, 4);

        for _ in 0..3 {
            calibrator.calibrate(&frames, &metas, true).unwrap();
            assert_eq!(
                calibrator.bad_pixel_map().flag_at(3, 4),
                BadPixelFlag::User
            );
        }
    }

    #[test]
    fn test_cold_pixel_is_flagged() {
        let shape = FrameShape::new(16, 8);
        let mut frames = dark_frame_set(shape, 100.0, 4.0, 20, 9);
        // Pixel (5, 2) is stuck at a constant value: zero variance.
        for frame in &mut frames {
            frame[[2, 5]] = 100;
        }
        let metas = default_metas(20);

        // The stuck pixel still sees the line common mode wander by about
        // sigma/sqrt(width), so the cold cut must sit above that.
        let mut params = quick_params();
        params.set_min_pixel_sigma(2.0).unwrap();
        let mut calibrator = DarkFrameCalibrator::new(params);
        calibrator.calibrate(&frames, &metas, false).unwrap();

        assert_eq!(calibrator.bad_pixel_map().flag_at(5, 2), BadPixelFlag::Cold);
        assert!(calibrator.info().n_bad_cold >= 1);
    }

    #[test]
    fn test_saturated_pixel_is_flagged() {
        let shape = FrameShape::new(16, 8);
        let mut frames = dark_frame_set(shape, 100.0, 4.0, 20, 13);
        for (i, frame) in frames.iter_mut().enumerate() {
            // High mean with enough spread to stay off the cold cut.
            frame[[3, 7]] = 8000 + (i as i16 % 5) * 3;
        }
        let metas = default_metas(20);

        let mut params = quick_params();
        params.set_saturation_cut(3000.0).unwrap();
        let mut calibrator = DarkFrameCalibrator::new(params);
        calibrator.calibrate(&frames, &metas, false).unwrap();

        assert_eq!(
            calibrator.bad_pixel_map().flag_at(7, 3),
            BadPixelFlag::Satur
        );
    }

    #[test]
    fn test_convergence_change_shrinks_with_events() {
        let shape = FrameShape::new(32, 16);
        let mut frames = dark_frame_set(shape, 150.0, 4.0, 25, 21);
        for (i, frame) in frames.iter_mut().enumerate() {
            sprinkle_events(frame, 12, 400, 100 + i as u64);
        }
        let metas = default_metas(25);

        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        calibrator.calibrate(&frames, &metas, false).unwrap();

        let sigmas = calibrator.pass_mean_sigmas();
        assert!(sigmas.len() >= 3, "expected at least three passes");
        // Event rejection starts with the second pass; the first change
        // dominates every later one.
        let diffs: Vec<f64> = sigmas.windows(2).map(|w| (w[0] - w[1]).abs()).collect();
        for &later in &diffs[1..] {
            assert!(
                later <= diffs[0] + 1e-9,
                "pass-to-pass change grew: {diffs:?}"
            );
        }
    }

    #[test]
    fn test_parameter_setters_reject_and_retain() {
        let mut params = CalibrationParams::default();
        assert!(params.set_max_pixel_sigma(0.5).is_err());
        assert_relative_eq!(params.max_pixel_sigma(), 32.0);

        assert!(params.set_min_pixel_sigma(-1.0).is_err());
        assert_relative_eq!(params.min_pixel_sigma(), 1.0);

        assert!(params.set_saturation_cut(0.0).is_err());
        assert_relative_eq!(params.saturation_cut(), 3000.0);

        assert!(params.set_empty_pixel_cut(1).is_err());
        assert_eq!(params.empty_pixel_cut(), 90);

        assert!(params.set_calib_event_threshold(0.05).is_err());
        assert_relative_eq!(params.calib_event_threshold(), 4.0);

        assert!(params.set_event_threshold(0.0).is_err());
        assert_relative_eq!(params.event_threshold(), 4.0);

        assert!(params.set_num_iter_before(0).is_err());
        assert_eq!(params.num_iter_before(), 4);

        assert!(params.set_num_iter_after(0).is_err());
        assert_eq!(params.num_iter_after(), 5);

        assert!(params.set_number_of_adcs(0).is_err());
        assert_eq!(params.number_of_adcs(), 1);

        assert!(params.set_max_pixel_sigma(10.0).is_ok());
        assert_relative_eq!(params.max_pixel_sigma(), 10.0);
    }

    #[test]
    fn test_threshold_map_is_multiplier_times_sigma() {
        let shape = FrameShape::new(32, 8);
        let frames = dark_frame_set(shape, 100.0, 5.0, 20, 31);
        let metas = default_metas(20);

        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        calibrator.calibrate(&frames, &metas, false).unwrap();

        let sigmas = calibrator.noise_map();
        for (threshold, sigma) in calibrator
            .event_threshold_map()
            .iter()
            .zip(sigmas.iter())
        {
            let expected = (4.0 * sigma).round().min(32767.0) as i16;
            assert_eq!(*threshold, expected);
        }
    }

    #[test]
    fn test_channel_noise_matches_column_means() {
        let shape = FrameShape::new(16, 8);
        let frames = dark_frame_set(shape, 100.0, 4.0, 15, 17);
        let metas = default_metas(15);

        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        calibrator.calibrate(&frames, &metas, false).unwrap();

        let sigmas = calibrator.noise_map();
        for x in 0..shape.width {
            let expected: f64 = (0..shape.height)
                .map(|y| sigmas[y * shape.width + x])
                .sum::<f64>()
                / shape.height as f64;
            assert_relative_eq!(calibrator.channel_noise()[x], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_line_common_modes_are_offset_corrected() {
        let shape = FrameShape::new(16, 4);
        let frames = dark_frame_set(shape, 100.0, 3.0, 10, 23);
        let metas = default_metas(10);

        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        assert!(calibrator.line_common_modes().is_none());
        calibrator.calibrate(&frames, &metas, false).unwrap();

        let corrected = calibrator.line_common_modes().unwrap();
        assert_eq!(corrected.len(), 10 * shape.height);
        // Raw common modes sit near the line offset, so the corrected
        // values scatter around zero.
        for &value in &corrected {
            assert!(value.abs() < 20, "corrected cmode too large: {value}");
        }
    }

    #[test]
    fn test_report_mentions_totals() {
        let shape = FrameShape::new(16, 8);
        let frames = dark_frame_set(shape, 100.0, 4.0, 10, 37);
        let metas = default_metas(10);

        let mut calibrator = DarkFrameCalibrator::new(quick_params());
        calibrator.calibrate(&frames, &metas, false).unwrap();

        let report = calibrator.generate_report();
        assert!(report.contains("# Dark Frame Calibration Report"));
        assert!(report.contains("16x8"));
        assert!(report.contains("Mean noise sigma"));
    }
}
