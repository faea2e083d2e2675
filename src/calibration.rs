//! Channel Calibration
//!
//! Removes fixed offset and sensor nonlinearity from raw averaged RGB
//! samples. Two calibration paths are supported:
//!
//! - **Baseline pass**: collect ~1 s of no-finger frames, derive a robust
//!   per-channel offset (5th percentile) and a gain that normalizes the
//!   channels to a common dynamic range.
//! - **Instant path**: when a finger is already on the lens, derive an
//!   approximate calibration from a single in-measurement sample so the
//!   pipeline does not have to wait for a clean baseline.
//!
//! Calibration never fails: before any calibration has completed, `apply`
//! uses a fixed default offset/gamma so the pipeline stays usable and the
//! quality validator reflects the lower fidelity.

use serde::{Deserialize, Serialize};

/// Number of baseline samples collected before computing a calibration
/// (~1 second at 30 Hz).
const BASELINE_SAMPLES: usize = 30;

/// sRGB-style gamma used for channel linearization.
const DEFAULT_GAMMA: f32 = 2.2;

/// Offset applied when no calibration has been computed yet.
const UNCALIBRATED_OFFSET: f32 = 8.0;

/// Per-channel calibration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Zero-light baseline per channel (R, G, B), >= 0.
    pub offset: [f32; 3],
    /// Per-channel gain, strictly positive.
    pub gain: [f32; 3],
    /// Gamma exponent for linearization, strictly positive.
    pub gamma: f32,
    /// Whether a calibration pass (or instant calibration) has completed.
    pub calibrated: bool,
    /// Baseline samples collected so far.
    pub sample_count: usize,
}

impl Default for CalibrationState {
    fn default() -> Self {
        Self {
            offset: [0.0; 3],
            gain: [1.0; 3],
            gamma: DEFAULT_GAMMA,
            calibrated: false,
            sample_count: 0,
        }
    }
}

/// Channel calibrator.
///
/// Owns the accumulated baseline samples and the current
/// [`CalibrationState`].
#[derive(Debug, Clone, Default)]
pub struct ChannelCalibrator {
    state: CalibrationState,
    samples: Vec<[f32; 3]>,
    in_progress: bool,
}

impl ChannelCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current calibration parameters.
    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn is_calibrated(&self) -> bool {
        self.state.calibrated
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Baseline collection progress in percent (0-100).
    ///
    /// Reports 100 once a calibration has completed, even though the
    /// baseline samples themselves are discarded at that point.
    pub fn progress(&self) -> f32 {
        if self.state.calibrated && !self.in_progress {
            return 100.0;
        }
        (self.samples.len() as f32 / BASELINE_SAMPLES as f32 * 100.0).min(100.0)
    }

    /// Start a baseline calibration pass.
    ///
    /// The caller is expected to supply no-finger frames via `add_sample`
    /// until it returns `true`.
    pub fn begin_calibration(&mut self) {
        self.samples.clear();
        self.in_progress = true;
        self.state.sample_count = 0;
    }

    /// Append one raw baseline sample.
    ///
    /// Returns `true` once enough samples have been collected and the
    /// calibration has been computed. Ignored unless a pass is in progress.
    pub fn add_sample(&mut self, r: f32, g: f32, b: f32) -> bool {
        if !self.in_progress {
            return false;
        }

        self.samples.push([r, g, b]);
        self.state.sample_count = self.samples.len();

        if self.samples.len() >= BASELINE_SAMPLES {
            self.compute_from_baseline();
            self.in_progress = false;
            return true;
        }
        false
    }

    /// Instant calibration from a single in-measurement sample.
    ///
    /// Used when a finger is already detected and waiting for a clean
    /// no-finger baseline is undesirable. Offset is a small fraction of the
    /// observed intensity, gain stays at unity.
    pub fn force_calibrate_from_sample(&mut self, r: f32, g: f32, b: f32) {
        self.state.offset = [
            (r * 0.025).max(0.0),
            (g * 0.025).max(0.0),
            (b * 0.025).max(0.0),
        ];
        self.state.gain = [1.0; 3];
        self.state.gamma = DEFAULT_GAMMA;
        self.state.calibrated = true;
        self.in_progress = false;
        self.samples.clear();
    }

    /// Apply calibration to one raw RGB triple.
    ///
    /// Subtracts the offset (clamped at zero), applies gain, then
    /// linearizes via `(v/255)^gamma * 255`. Uncalibrated instances use a
    /// fixed default offset and gamma so the output remains usable.
    pub fn apply(&self, r: f32, g: f32, b: f32) -> [f32; 3] {
        let raw = [r, g, b];
        let mut out = [0.0f32; 3];
        for c in 0..3 {
            let (offset, gain) = if self.state.calibrated {
                (self.state.offset[c], self.state.gain[c])
            } else {
                (UNCALIBRATED_OFFSET, 1.0)
            };
            let v = (raw[c] - offset).max(0.0) * gain;
            out[c] = (v / 255.0).powf(self.state.gamma) * 255.0;
        }
        out
    }

    /// Discard all calibration state and any pass in progress.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn compute_from_baseline(&mut self) {
        let mut spans = [0.0f32; 3];
        for c in 0..3 {
            let mut channel: Vec<f32> = self.samples.iter().map(|s| s[c]).collect();
            channel.sort_by(|a, b| a.total_cmp(b));

            // 5th percentile is robust against transient bright outliers.
            self.state.offset[c] = percentile_sorted(&channel, 5.0).max(0.0);
            spans[c] =
                (percentile_sorted(&channel, 95.0) - percentile_sorted(&channel, 5.0)).max(1.0);
        }

        // Normalize all channels to the widest dynamic range. Clamped so a
        // near-flat baseline channel cannot produce an explosive gain.
        let reference = spans[0].max(spans[1]).max(spans[2]);
        for c in 0..3 {
            self.state.gain[c] = (reference / spans[c]).clamp(0.5, 2.0);
        }

        self.state.gamma = DEFAULT_GAMMA;
        self.state.calibrated = true;
        self.samples.clear();
    }
}

/// Linear-interpolated percentile over an ascending-sorted slice.
pub(crate) fn percentile_sorted(sorted: &[f32], pct: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
