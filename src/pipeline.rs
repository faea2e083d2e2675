//! Per-frame pipeline orchestration.
//!
//! Owns the calibrator, band-pass filter, peak detector and quality
//! validator, and drives them once per camera frame: region-of-interest
//! channel averages, calibration state machine (baseline pass or instant
//! path), rolling buffers, fused AC/DC estimation, channel selection with
//! saturation fallback, debounced finger detection, SpO2 from the ratio of
//! ratios, HRV, and synchronous event listeners.
//!
//! Single-threaded by design: every step runs to completion inside
//! `process_frame`, all mutable state is exclusively owned, and listeners
//! are invoked inline on the frame-processing call stack. A slow listener
//! directly increases per-frame latency.

use crate::calibration::{percentile_sorted, CalibrationState, ChannelCalibrator};
use crate::dsp::filters::{BandpassFilter, FilterConfig, FilterOrder};
use crate::dsp::peaks::{HrvSummary, PeakConfig, PeakDetector};
use crate::dsp::quality::{SignalConfidence, SqiResult, SqiValidator};

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f32::consts::SQRT_2;
use tracing::{debug, info};

/// Finger-presence gate. All thresholds are empirically tuned and kept
/// configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FingerConfig {
    /// Minimum raw red intensity for a plausible fingertip.
    pub min_red_intensity: f32,
    /// Acceptable raw red/green ratio band.
    pub ratio_min: f32,
    pub ratio_max: f32,
    /// Channels at or above this raw value count as saturated.
    pub saturation_limit: f32,
    /// Consecutive qualifying frames required before the flag flips.
    pub required_streak: usize,
    /// Number of recent red values checked for stability.
    pub stability_window: usize,
    /// Maximum variance of recent red values.
    pub max_red_variance: f32,
}

impl Default for FingerConfig {
    fn default() -> Self {
        Self {
            min_red_intensity: 50.0,
            ratio_min: 1.0,
            ratio_max: 4.0,
            saturation_limit: 253.0,
            required_streak: 5,
            stability_window: 10,
            max_red_variance: 100.0,
        }
    }
}

/// Heuristic SpO2 estimation from the red/green ratio of ratios.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spo2Config {
    /// Plausible ratio-of-ratios window; outside it the estimate is 0.
    pub ratio_min: f32,
    pub ratio_max: f32,
    /// `spo2 = 100 - slope * (R - reference_ratio)`.
    pub slope: f32,
    pub reference_ratio: f32,
    /// Weak signals underestimate; compensate below this perfusion.
    pub low_perfusion_pct: f32,
    pub low_perfusion_adjust: f32,
    /// Strong perfusion overestimates slightly.
    pub high_perfusion_pct: f32,
    pub high_perfusion_adjust: f32,
    /// Implausible results outside this band are rejected as 0.
    pub plausible_min: f32,
    pub plausible_max: f32,
    /// Surviving results are clamped to this reportable band.
    pub clamp_min: f32,
    pub clamp_max: f32,
}

impl Default for Spo2Config {
    fn default() -> Self {
        Self {
            ratio_min: 0.4,
            ratio_max: 2.5,
            slope: 15.0,
            reference_ratio: 0.8,
            low_perfusion_pct: 1.0,
            low_perfusion_adjust: 2.0,
            high_perfusion_pct: 5.0,
            high_perfusion_adjust: -1.0,
            plausible_min: 50.0,
            plausible_max: 105.0,
            clamp_min: 70.0,
            clamp_max: 100.0,
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Sample rate in Hz; drives all filter, FFT and timing constants.
    pub sample_rate: f32,
    pub filter_order: FilterOrder,
    pub notch_enabled: bool,
    /// Fraction of the frame *area* used as the central ROI.
    pub roi_area_fraction: f32,
    /// Sub-sampling stride inside the ROI for cost control.
    pub pixel_stride: usize,
    /// Rolling buffer capacity in samples (10 s at 30 Hz).
    pub buffer_capacity: usize,
    /// Window for AC/DC estimation.
    pub ac_dc_window: usize,
    /// Buffered samples required before AC/DC is computed.
    pub min_ac_dc_samples: usize,
    /// Window of filtered samples handed to the quality validator.
    pub sqi_window: usize,
    /// AC is zeroed when the red or green AC/DC ratio falls below this
    /// (percent); there is effectively no pulsatile component.
    pub min_ratio_pct: f32,
    /// Raw red above this is saturated; the green channel is used instead.
    pub red_saturation: f32,
    /// Raw red required for the instant-calibration path.
    pub instant_calibration_red: f32,
    pub finger: FingerConfig,
    pub spo2: Spo2Config,
    pub peak: PeakConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 30.0,
            filter_order: FilterOrder::Second,
            notch_enabled: true,
            roi_area_fraction: 0.85,
            pixel_stride: 4,
            buffer_capacity: 300,
            ac_dc_window: 90,
            min_ac_dc_samples: 30,
            sqi_window: 90,
            min_ratio_pct: 0.1,
            red_saturation: 250.0,
            instant_calibration_red: 100.0,
            finger: FingerConfig::default(),
            spo2: Spo2Config::default(),
            peak: PeakConfig::default(),
        }
    }
}

/// Discrete pipeline events, delivered synchronously to listeners.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    CalibrationStart {
        timestamp_ms: f64,
    },
    CalibrationComplete {
        timestamp_ms: f64,
        calibration: CalibrationState,
    },
    PeakDetected {
        timestamp_ms: f64,
        bpm: f32,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PipelineEvent::CalibrationStart { .. } => EventKind::CalibrationStart,
            PipelineEvent::CalibrationComplete { .. } => EventKind::CalibrationComplete,
            PipelineEvent::PeakDetected { .. } => EventKind::PeakDetected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CalibrationStart,
    CalibrationComplete,
    PeakDetected,
}

/// Handle returned by [`PulsePipeline::on`]; pass to `off` to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&PipelineEvent)>;

struct ListenerEntry {
    id: ListenerId,
    kind: EventKind,
    callback: Listener,
}

/// Coarse pipeline status, updated every processed frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineState {
    pub calibrating: bool,
    /// Baseline calibration progress, 0-100.
    pub calibration_progress: f32,
    pub processing: bool,
    pub frames_processed: u64,
    pub last_bpm: f32,
    pub last_spo2: f32,
    pub last_confidence: Option<SignalConfidence>,
}

/// Fully populated per-frame output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameResult {
    pub timestamp_ms: f64,
    /// Raw ROI channel averages.
    pub raw_rgb: [f32; 3],
    /// Channel averages after calibration.
    pub calibrated_rgb: [f32; 3],
    /// Band-pass output for the primary channel this frame.
    pub filtered_value: f32,
    pub finger_detected: bool,
    pub red_ac: f32,
    pub red_dc: f32,
    pub green_ac: f32,
    pub green_dc: f32,
    /// Red AC/DC in percent.
    pub perfusion_index: f32,
    /// Ratio of ratios `(redAC/redDC) / (greenAC/greenDC)`; 0 when
    /// undefined.
    pub ratio_r: f32,
    /// Whether a beat landed on this frame.
    pub peak: bool,
    /// BPM from the most recent RR interval.
    pub instantaneous_bpm: f32,
    pub smoothed_bpm: f32,
    /// RR interval completed by this frame's beat, if any.
    pub rr_interval_ms: Option<f32>,
    pub rr_history_ms: Vec<f32>,
    pub hrv: HrvSummary,
    pub sqi: SqiResult,
    pub confidence: SignalConfidence,
    /// Heuristic SpO2 estimate; 0 when rejected.
    pub spo2: f32,
}

/// The PPG processing pipeline.
///
/// One instance per camera session. Not internally synchronized; the
/// caller must invoke `process_frame` from a single thread.
pub struct PulsePipeline {
    config: PipelineConfig,
    running: bool,

    calibrator: ChannelCalibrator,
    filter: BandpassFilter,
    detector: PeakDetector,
    validator: SqiValidator,

    red: VecDeque<f32>,
    green: VecDeque<f32>,
    blue: VecDeque<f32>,
    filtered: VecDeque<f32>,

    red_ac: f32,
    red_dc: f32,
    green_ac: f32,
    green_dc: f32,

    finger_detected: bool,
    finger_streak: usize,
    recent_red: VecDeque<f32>,

    last_timestamp_ms: f64,
    last_raw: [f32; 3],

    state: PipelineState,
    listeners: Vec<ListenerEntry>,
    next_listener_id: u64,
}

impl PulsePipeline {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let filter = BandpassFilter::with_config(FilterConfig {
            sample_rate: config.sample_rate,
            order: config.filter_order,
            notch_enabled: config.notch_enabled,
            ..FilterConfig::default()
        });
        let detector = PeakDetector::with_config(PeakConfig {
            sample_rate: config.sample_rate,
            ..config.peak.clone()
        });
        let validator = SqiValidator::with_sample_rate(config.sample_rate);

        Self {
            config,
            running: false,
            calibrator: ChannelCalibrator::new(),
            filter,
            detector,
            validator,
            red: VecDeque::new(),
            green: VecDeque::new(),
            blue: VecDeque::new(),
            filtered: VecDeque::new(),
            red_ac: 0.0,
            red_dc: 0.0,
            green_ac: 0.0,
            green_dc: 0.0,
            finger_detected: false,
            finger_streak: 0,
            recent_red: VecDeque::new(),
            last_timestamp_ms: 0.0,
            last_raw: [0.0; 3],
            state: PipelineState::default(),
            listeners: Vec::new(),
            next_listener_id: 0,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn finger_detected(&self) -> bool {
        self.finger_detected
    }

    pub fn calibration(&self) -> &CalibrationState {
        self.calibrator.state()
    }

    /// Rolling-buffer fill ratio, 0-1.
    pub fn buffer_fill(&self) -> f32 {
        self.red.len() as f32 / self.config.buffer_capacity as f32
    }

    /// Register a listener for one event kind. Listeners are invoked
    /// synchronously, in registration order, on the frame-processing call
    /// stack; they must not block.
    pub fn on(
        &mut self,
        kind: EventKind,
        callback: impl FnMut(&PipelineEvent) + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push(ListenerEntry {
            id,
            kind,
            callback: Box::new(callback),
        });
        id
    }

    /// Remove a listener. Returns `false` if the id was not registered.
    pub fn off(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|entry| entry.id != id);
        self.listeners.len() != before
    }

    pub fn start(&mut self) {
        self.running = true;
        self.state.processing = true;
        info!("ppg pipeline started");
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.state.processing = false;
        info!("ppg pipeline stopped");
    }

    /// Begin a no-finger baseline calibration pass.
    pub fn start_calibration(&mut self) {
        self.calibrator.begin_calibration();
        self.state.calibrating = true;
        self.state.calibration_progress = 0.0;
        info!("calibration started");
        self.emit(PipelineEvent::CalibrationStart {
            timestamp_ms: self.last_timestamp_ms,
        });
    }

    /// Calibrate immediately from the most recent raw sample, skipping the
    /// baseline pass.
    pub fn force_calibration(&mut self) {
        let [r, g, b] = self.last_raw;
        self.calibrator.force_calibrate_from_sample(r, g, b);
        self.state.calibrating = false;
        self.state.calibration_progress = 100.0;
        info!(red = r, green = g, blue = b, "instant calibration applied");
        self.emit(PipelineEvent::CalibrationComplete {
            timestamp_ms: self.last_timestamp_ms,
            calibration: self.calibrator.state().clone(),
        });
    }

    /// Process one camera frame.
    ///
    /// `frame` is a packed pixel buffer with `channels` bytes per pixel
    /// (3 = RGB, 4 = RGBA); only the first three channels are read and the
    /// buffer is not retained. Returns `None` while the pipeline is
    /// stopped.
    pub fn process_frame(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        channels: u8,
        timestamp_ms: f64,
    ) -> Option<FrameResult> {
        if !self.running {
            return None;
        }

        // 1. ROI channel averages.
        let raw = self.roi_mean_rgb(frame, width, height, channels);
        self.last_raw = raw;
        self.last_timestamp_ms = timestamp_ms;

        // 2. Calibration state machine.
        self.advance_calibration(raw, timestamp_ms);

        // 3. Calibrated rolling buffers.
        let calibrated = self.calibrator.apply(raw[0], raw[1], raw[2]);
        self.red.push_back(calibrated[0]);
        self.green.push_back(calibrated[1]);
        self.blue.push_back(calibrated[2]);
        while self.red.len() > self.config.buffer_capacity {
            self.red.pop_front();
            self.green.pop_front();
            self.blue.pop_front();
        }

        // 4. AC/DC over the most recent window.
        self.update_ac_dc();
        let perfusion_index = if self.red_dc > 1e-6 {
            self.red_ac / self.red_dc * 100.0
        } else {
            0.0
        };

        // 5. Primary channel (green fallback when red saturates) through
        // the band-pass filter.
        let primary = if raw[0] > self.config.red_saturation {
            calibrated[1]
        } else {
            calibrated[0]
        };
        let filtered_value = self.filter.process(primary);
        self.filtered.push_back(filtered_value);
        while self.filtered.len() > self.config.buffer_capacity {
            self.filtered.pop_front();
        }

        // 6. Debounced finger gate.
        let was_detected = self.finger_detected;
        self.update_finger(raw);
        if self.finger_detected != was_detected {
            debug!(detected = self.finger_detected, "finger state changed");
        }

        // Peak detection only runs with a finger on the lens.
        let peak = if self.finger_detected {
            self.detector
                .process_sample(filtered_value, timestamp_ms, Some(perfusion_index))
        } else {
            None
        };
        if let Some(ref p) = peak {
            debug!(bpm = self.detector.smoothed_bpm(), confidence = p.confidence, "beat");
            self.emit(PipelineEvent::PeakDetected {
                timestamp_ms: p.timestamp_ms,
                bpm: self.detector.smoothed_bpm(),
            });
        }

        // 7. Quality over the last filtered window.
        let sqi_len = self.config.sqi_window.min(self.filtered.len());
        let sqi_window: Array1<f32> = self
            .filtered
            .iter()
            .skip(self.filtered.len() - sqi_len)
            .copied()
            .collect();
        let sqi = self.validator.validate(&sqi_window, self.red_ac, self.red_dc);

        // 8. SpO2 from the ratio of ratios.
        let ratio_r = self.ratio_of_ratios();
        let spo2 = self.estimate_spo2(ratio_r, perfusion_index);

        // 9. HRV from the detector's RR history.
        let rr_history_ms = self.detector.rr_history();
        let hrv = self.detector.hrv();
        let instantaneous_bpm = rr_history_ms
            .last()
            .map(|&rr| 60_000.0 / rr)
            .unwrap_or(0.0);
        let smoothed_bpm = self.detector.smoothed_bpm();

        // 10. State update.
        self.state.frames_processed += 1;
        self.state.calibrating = self.calibrator.is_in_progress();
        self.state.calibration_progress = self.calibrator.progress();
        self.state.last_bpm = smoothed_bpm;
        self.state.last_spo2 = spo2;
        self.state.last_confidence = Some(sqi.confidence);

        let confidence = sqi.confidence;
        Some(FrameResult {
            timestamp_ms,
            raw_rgb: raw,
            calibrated_rgb: calibrated,
            filtered_value,
            finger_detected: self.finger_detected,
            red_ac: self.red_ac,
            red_dc: self.red_dc,
            green_ac: self.green_ac,
            green_dc: self.green_dc,
            perfusion_index,
            ratio_r,
            peak: peak.is_some(),
            instantaneous_bpm,
            smoothed_bpm,
            rr_interval_ms: peak.and_then(|p| p.rr_ms),
            rr_history_ms,
            hrv,
            sqi,
            confidence,
            spo2,
        })
    }

    /// Clear all rolling state. Calibration survives; use
    /// [`PulsePipeline::reset_all`] to discard it too.
    pub fn reset(&mut self) {
        self.red.clear();
        self.green.clear();
        self.blue.clear();
        self.filtered.clear();
        self.red_ac = 0.0;
        self.red_dc = 0.0;
        self.green_ac = 0.0;
        self.green_dc = 0.0;
        self.finger_detected = false;
        self.finger_streak = 0;
        self.recent_red.clear();
        self.filter.reset();
        self.detector.reset();
        self.state = PipelineState {
            processing: self.running,
            ..PipelineState::default()
        };
    }

    /// Full reset including calibration.
    pub fn reset_all(&mut self) {
        self.reset();
        self.calibrator.reset();
    }

    /// Stop processing, reset, and drop all listeners.
    pub fn dispose(&mut self) {
        self.stop();
        self.reset();
        self.listeners.clear();
    }

    fn emit(&mut self, event: PipelineEvent) {
        let kind = event.kind();
        for entry in &mut self.listeners {
            if entry.kind == kind {
                (entry.callback)(&event);
            }
        }
    }

    fn advance_calibration(&mut self, raw: [f32; 3], timestamp_ms: f64) {
        if self.calibrator.is_in_progress() {
            let done = self.calibrator.add_sample(raw[0], raw[1], raw[2]);
            self.state.calibration_progress = self.calibrator.progress();
            if done {
                self.state.calibrating = false;
                info!("baseline calibration complete");
                self.emit(PipelineEvent::CalibrationComplete {
                    timestamp_ms,
                    calibration: self.calibrator.state().clone(),
                });
            }
            return;
        }

        // Instant path: a finger is already on the lens of an uncalibrated
        // pipeline; time-to-first-reading beats calibration purity.
        if !self.calibrator.is_calibrated()
            && raw[0] > self.config.instant_calibration_red
            && self.finger_plausible(raw)
        {
            self.calibrator
                .force_calibrate_from_sample(raw[0], raw[1], raw[2]);
            debug!(red = raw[0], "instant calibration from in-measurement sample");
            self.emit(PipelineEvent::CalibrationComplete {
                timestamp_ms,
                calibration: self.calibrator.state().clone(),
            });
        }
    }

    /// Instantaneous (un-debounced) finger criteria.
    fn finger_plausible(&self, raw: [f32; 3]) -> bool {
        let cfg = &self.config.finger;
        let ratio = raw[0] / raw[1].max(1e-6);
        raw[0] >= cfg.min_red_intensity
            && ratio >= cfg.ratio_min
            && ratio <= cfg.ratio_max
            && raw.iter().all(|&c| c < cfg.saturation_limit)
    }

    fn update_finger(&mut self, raw: [f32; 3]) {
        let cfg = &self.config.finger;
        if self.finger_plausible(raw) {
            self.finger_streak += 1;
            self.recent_red.push_back(raw[0]);
            while self.recent_red.len() > cfg.stability_window {
                self.recent_red.pop_front();
            }
        } else {
            // Any disqualifying frame resets the streak and the stability
            // window.
            self.finger_streak = 0;
            self.recent_red.clear();
            self.finger_detected = false;
            return;
        }

        let stable = if self.recent_red.len() >= 2 {
            let n = self.recent_red.len() as f32;
            let mean = self.recent_red.iter().sum::<f32>() / n;
            let var = self
                .recent_red
                .iter()
                .map(|x| (x - mean).powi(2))
                .sum::<f32>()
                / n;
            var < cfg.max_red_variance
        } else {
            true
        };

        self.finger_detected = self.finger_streak >= cfg.required_streak && stable;
    }

    fn update_ac_dc(&mut self) {
        if self.red.len() < self.config.min_ac_dc_samples {
            return;
        }

        let (red_dc, red_ac) = Self::channel_ac_dc(&self.red, self.config.ac_dc_window);
        let (green_dc, green_ac) = Self::channel_ac_dc(&self.green, self.config.ac_dc_window);
        self.red_dc = red_dc;
        self.green_dc = green_dc;
        self.red_ac = red_ac;
        self.green_ac = green_ac;

        // Suppress ratio noise when there is effectively no pulsatile
        // component on either leg of the ratio of ratios.
        let floor = self.config.min_ratio_pct / 100.0;
        let red_ratio = if red_dc > 1e-6 { red_ac / red_dc } else { 0.0 };
        let green_ratio = if green_dc > 1e-6 { green_ac / green_dc } else { 0.0 };
        if red_ratio < floor || green_ratio < floor {
            self.red_ac = 0.0;
            self.green_ac = 0.0;
        }
    }

    /// DC = window mean; AC fuses an RMS-deviation estimate with a robust
    /// 5th-95th percentile peak-to-peak estimate.
    fn channel_ac_dc(buffer: &VecDeque<f32>, window: usize) -> (f32, f32) {
        let len = window.min(buffer.len());
        let start = buffer.len() - len;
        let window: Vec<f32> = buffer.iter().skip(start).copied().collect();

        let dc = window.iter().sum::<f32>() / len as f32;
        let rms = (window.iter().map(|x| (x - dc).powi(2)).sum::<f32>() / len as f32).sqrt();

        let mut sorted = window;
        sorted.sort_by(|a, b| a.total_cmp(b));
        let p2p = percentile_sorted(&sorted, 95.0) - percentile_sorted(&sorted, 5.0);

        let ac = (SQRT_2 * rms + 0.5 * p2p) / 2.0;
        (dc, ac)
    }

    fn ratio_of_ratios(&self) -> f32 {
        if self.red_dc < 1e-6 || self.green_dc < 1e-6 || self.green_ac < 1e-6 {
            return 0.0;
        }
        (self.red_ac / self.red_dc) / (self.green_ac / self.green_dc)
    }

    fn estimate_spo2(&self, ratio_r: f32, perfusion_pct: f32) -> f32 {
        let cfg = &self.config.spo2;
        if ratio_r < cfg.ratio_min || ratio_r > cfg.ratio_max {
            return 0.0;
        }

        let mut spo2 = 100.0 - cfg.slope * (ratio_r - cfg.reference_ratio);
        if perfusion_pct < cfg.low_perfusion_pct {
            spo2 += cfg.low_perfusion_adjust;
        } else if perfusion_pct > cfg.high_perfusion_pct {
            spo2 += cfg.high_perfusion_adjust;
        }

        if spo2 < cfg.plausible_min || spo2 > cfg.plausible_max {
            return 0.0;
        }
        spo2.clamp(cfg.clamp_min, cfg.clamp_max).round()
    }

    /// Mean RGB over the central ROI, sub-sampled for cost control.
    ///
    /// The ROI covers `roi_area_fraction` of the frame area, centered.
    /// Degenerate frames produce a zero triple rather than failing.
    fn roi_mean_rgb(&self, frame: &[u8], width: u32, height: u32, channels: u8) -> [f32; 3] {
        let (width, height) = (width as usize, height as usize);
        let channels = channels as usize;
        if width == 0 || height == 0 || channels < 3 || frame.len() < width * height * channels {
            return [0.0; 3];
        }

        let side = self.config.roi_area_fraction.clamp(0.01, 1.0).sqrt();
        let roi_w = ((width as f32 * side) as usize).max(1);
        let roi_h = ((height as f32 * side) as usize).max(1);
        let x0 = (width - roi_w) / 2;
        let y0 = (height - roi_h) / 2;
        let stride = self.config.pixel_stride.max(1);

        let mut sum = [0.0f64; 3];
        let mut count = 0u64;
        for y in (y0..y0 + roi_h).step_by(stride) {
            let row = y * width;
            for x in (x0..x0 + roi_w).step_by(stride) {
                let idx = (row + x) * channels;
                sum[0] += frame[idx] as f64;
                sum[1] += frame[idx + 1] as f64;
                sum[2] += frame[idx + 2] as f64;
                count += 1;
            }
        }

        if count == 0 {
            return [0.0; 3];
        }
        let inv = 1.0 / count as f64;
        [
            (sum[0] * inv) as f32,
            (sum[1] * inv) as f32,
            (sum[2] * inv) as f32,
        ]
    }
}

impl Default for PulsePipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Uniform RGB frame helper.
    fn flat_frame(r: u8, g: u8, b: u8, width: u32, height: u32) -> Vec<u8> {
        let mut frame = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..width * height {
            frame.extend_from_slice(&[r, g, b]);
        }
        frame
    }

    #[test]
    fn test_not_running_returns_none() {
        let mut pipeline = PulsePipeline::new();
        let frame = flat_frame(180, 90, 60, 32, 32);
        assert!(pipeline.process_frame(&frame, 32, 32, 3, 0.0).is_none());
    }

    #[test]
    fn test_roi_mean_of_flat_frame() {
        let pipeline = PulsePipeline::new();
        let frame = flat_frame(180, 90, 60, 64, 48);
        let rgb = pipeline.roi_mean_rgb(&frame, 64, 48, 3);
        assert!((rgb[0] - 180.0).abs() < 0.5);
        assert!((rgb[1] - 90.0).abs() < 0.5);
        assert!((rgb[2] - 60.0).abs() < 0.5);
    }

    #[test]
    fn test_degenerate_frame_is_zero() {
        let pipeline = PulsePipeline::new();
        assert_eq!(pipeline.roi_mean_rgb(&[], 0, 0, 3), [0.0; 3]);
        assert_eq!(pipeline.roi_mean_rgb(&[1, 2], 64, 48, 3), [0.0; 3]);
    }

    #[test]
    fn test_rgba_frames_accepted() {
        let pipeline = PulsePipeline::new();
        let mut frame = Vec::new();
        for _ in 0..32 * 32 {
            frame.extend_from_slice(&[100, 50, 25, 255]);
        }
        let rgb = pipeline.roi_mean_rgb(&frame, 32, 32, 4);
        assert!((rgb[0] - 100.0).abs() < 0.5);
    }

    #[test]
    fn test_finger_debounce_requires_streak() {
        let mut pipeline = PulsePipeline::new();
        pipeline.start();
        let good = flat_frame(180, 90, 60, 32, 32);
        let bad = flat_frame(10, 10, 10, 32, 32);

        // A single qualifying frame must not flip the flag.
        let result = pipeline.process_frame(&good, 32, 32, 3, 0.0).unwrap();
        assert!(!result.finger_detected);

        // Four more: now the streak is satisfied.
        let mut last = None;
        for i in 1..5 {
            last = pipeline.process_frame(&good, 32, 32, 3, i as f64 * 33.3);
        }
        assert!(last.unwrap().finger_detected);

        // One disqualifying frame resets the streak.
        let result = pipeline.process_frame(&bad, 32, 32, 3, 200.0).unwrap();
        assert!(!result.finger_detected);
        let result = pipeline.process_frame(&good, 32, 32, 3, 233.0).unwrap();
        assert!(!result.finger_detected);
    }

    #[test]
    fn test_unstable_red_blocks_detection() {
        let mut pipeline = PulsePipeline::new();
        pipeline.start();

        // Alternate red intensity wildly; each frame passes the
        // instantaneous gate but the variance gate must hold the flag low.
        for i in 0..12 {
            let red = if i % 2 == 0 { 120 } else { 220 };
            let frame = flat_frame(red, 90, 60, 32, 32);
            let result = pipeline.process_frame(&frame, 32, 32, 3, i as f64 * 33.3).unwrap();
            assert!(!result.finger_detected, "frame {}", i);
        }
    }

    #[test]
    fn test_instant_calibration_fires() {
        let mut pipeline = PulsePipeline::new();
        pipeline.start();

        let completed = Rc::new(RefCell::new(0));
        let counter = completed.clone();
        pipeline.on(EventKind::CalibrationComplete, move |_| {
            *counter.borrow_mut() += 1;
        });

        let frame = flat_frame(180, 90, 60, 32, 32);
        pipeline.process_frame(&frame, 32, 32, 3, 0.0);

        assert!(pipeline.calibration().calibrated);
        assert_eq!(*completed.borrow(), 1);
    }

    #[test]
    fn test_baseline_calibration_pass() {
        let mut pipeline = PulsePipeline::new();
        pipeline.start();

        let started = Rc::new(RefCell::new(false));
        let flag = started.clone();
        pipeline.on(EventKind::CalibrationStart, move |_| {
            *flag.borrow_mut() = true;
        });

        pipeline.start_calibration();
        assert!(*started.borrow());
        assert!(pipeline.state().calibrating);

        // Dark no-finger frames; too dim for the instant path.
        let dark = flat_frame(12, 10, 9, 32, 32);
        for i in 0..30 {
            pipeline.process_frame(&dark, 32, 32, 3, i as f64 * 33.3);
        }
        assert!(pipeline.calibration().calibrated);
        assert!(!pipeline.state().calibrating);
        assert!((pipeline.state().calibration_progress - 100.0).abs() < 0.1);
    }

    #[test]
    fn test_spo2_formula() {
        let pipeline = PulsePipeline::new();

        // Out-of-window ratios are rejected.
        assert_eq!(pipeline.estimate_spo2(0.3, 2.0), 0.0);
        assert_eq!(pipeline.estimate_spo2(2.6, 2.0), 0.0);

        // R = 0.8 with mid-range perfusion: exactly 100.
        assert_eq!(pipeline.estimate_spo2(0.8, 2.0), 100.0);

        // Higher ratio lowers the estimate.
        assert_eq!(pipeline.estimate_spo2(1.2, 2.0), 94.0);

        // Weak perfusion compensates upward (then clamps at 100).
        assert_eq!(pipeline.estimate_spo2(1.2, 0.5), 96.0);
        // Strong perfusion adjusts downward.
        assert_eq!(pipeline.estimate_spo2(1.2, 6.0), 93.0);
    }

    #[test]
    fn test_listener_off() {
        let mut pipeline = PulsePipeline::new();
        let hits = Rc::new(RefCell::new(0));
        let counter = hits.clone();
        let id = pipeline.on(EventKind::CalibrationStart, move |_| {
            *counter.borrow_mut() += 1;
        });

        pipeline.start_calibration();
        assert_eq!(*hits.borrow(), 1);

        assert!(pipeline.off(id));
        assert!(!pipeline.off(id));
        pipeline.start_calibration();
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn test_reset_keeps_calibration() {
        let mut pipeline = PulsePipeline::new();
        pipeline.start();
        let frame = flat_frame(180, 90, 60, 32, 32);
        for i in 0..10 {
            pipeline.process_frame(&frame, 32, 32, 3, i as f64 * 33.3);
        }
        assert!(pipeline.calibration().calibrated);

        pipeline.reset();
        assert!(pipeline.calibration().calibrated);
        assert_eq!(pipeline.state().frames_processed, 0);
        assert!(!pipeline.finger_detected());

        pipeline.reset_all();
        assert!(!pipeline.calibration().calibrated);
    }

    #[test]
    fn test_dispose_clears_listeners() {
        let mut pipeline = PulsePipeline::new();
        pipeline.start();
        pipeline.on(EventKind::PeakDetected, |_| {});
        pipeline.dispose();
        assert!(!pipeline.is_running());
        assert!(pipeline.listeners.is_empty());
    }
}
