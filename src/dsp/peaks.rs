//! Beat detection with the Hilbert double-envelope method.
//!
//! The detector consumes filtered samples one at a time, keeps a rolling
//! window, and builds an adaptive threshold from two successive Hilbert
//! envelopes instead of a fixed amplitude cutoff. Accepted beats update an
//! RR-interval ring and an exponentially smoothed BPM.
//!
//! All gating constants are empirically tuned and live in [`PeakConfig`]
//! rather than as hard constants.

use crate::dsp::hilbert::HilbertEngine;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Tuned detector gates. Defaults are the values validated at 30 Hz.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakConfig {
    /// Sample rate in Hz.
    pub sample_rate: f32,
    /// Minimum buffered samples before detection starts (1.5 s at 30 Hz).
    pub min_samples: usize,
    /// Analysis window for the envelope threshold (3 s at 30 Hz).
    pub window: usize,
    /// Rolling buffer capacity (10 s at 30 Hz).
    pub buffer_capacity: usize,
    /// RR-interval ring capacity.
    pub rr_capacity: usize,
    /// Refractory period between accepted beats (caps rate at 240 BPM).
    pub refractory_ms: f32,
    /// Longest RR interval accepted into the ring (floor of 20 BPM).
    pub max_rr_ms: f32,
    /// Perfusion-index acceptance band in percent. Intentionally loose;
    /// tightness is delegated to the quality validator.
    pub min_perfusion_pct: f32,
    pub max_perfusion_pct: f32,
    /// Candidate amplitude must exceed this fraction of the local
    /// double-envelope threshold.
    pub amplitude_threshold_ratio: f32,
    /// Candidate amplitude must exceed this multiple of the window mean.
    pub amplitude_mean_ratio: f32,
    /// Minimum (amplitude - mean) / std.
    pub min_snr: f32,
    /// Exponential blend toward the previous BPM estimate.
    pub bpm_smoothing: f32,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            sample_rate: 30.0,
            min_samples: 45,
            window: 90,
            buffer_capacity: 300,
            rr_capacity: 30,
            refractory_ms: 250.0,
            max_rr_ms: 3000.0,
            min_perfusion_pct: 0.005,
            max_perfusion_pct: 30.0,
            amplitude_threshold_ratio: 0.7,
            amplitude_mean_ratio: 1.02,
            min_snr: 0.5,
            bpm_smoothing: 0.8,
        }
    }
}

/// One accepted beat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peak {
    /// Global sample index at which the beat was found.
    pub index: u64,
    /// Beat timestamp in milliseconds.
    pub timestamp_ms: f64,
    /// Filtered-signal amplitude at the beat.
    pub amplitude: f32,
    /// Detection confidence (0-1), `min(1, snr / 3)`.
    pub confidence: f32,
    /// RR interval to the previous beat, if one was accepted.
    pub rr_ms: Option<f32>,
}

/// Heart-rate-variability summary over the RR ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HrvSummary {
    /// Population standard deviation of RR intervals (ms).
    pub sdnn_ms: f32,
    /// Root mean square of successive RR differences (ms).
    pub rmssd_ms: f32,
    /// Percentage of successive differences exceeding 50 ms.
    pub pnn50_pct: f32,
}

/// Result of offline detection over a complete signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDetection {
    pub peaks: Vec<Peak>,
    pub rr_ms: Vec<f32>,
    /// BPM from the most recent RR interval.
    pub instantaneous_bpm: f32,
    /// BPM from the mean RR interval.
    pub average_bpm: f32,
    pub hrv: HrvSummary,
}

/// Streaming double-envelope peak detector.
pub struct PeakDetector {
    config: PeakConfig,
    engine: HilbertEngine,
    buffer: VecDeque<f32>,
    timestamps: VecDeque<f64>,
    rr: VecDeque<f32>,
    last_peak_ms: Option<f64>,
    smoothed_bpm: f32,
    sample_index: u64,
}

impl PeakDetector {
    pub fn new() -> Self {
        Self::with_config(PeakConfig::default())
    }

    pub fn with_config(config: PeakConfig) -> Self {
        let engine = HilbertEngine::with_sample_rate(config.sample_rate);
        Self {
            config,
            engine,
            buffer: VecDeque::new(),
            timestamps: VecDeque::new(),
            rr: VecDeque::new(),
            last_peak_ms: None,
            smoothed_bpm: 0.0,
            sample_index: 0,
        }
    }

    pub fn config(&self) -> &PeakConfig {
        &self.config
    }

    /// Exponentially smoothed BPM, 0.0 until the first interval.
    pub fn smoothed_bpm(&self) -> f32 {
        self.smoothed_bpm
    }

    /// RR intervals currently in the ring, oldest first.
    pub fn rr_history(&self) -> Vec<f32> {
        self.rr.iter().copied().collect()
    }

    /// HRV over the current RR ring.
    pub fn hrv(&self) -> HrvSummary {
        let rr: Vec<f32> = self.rr.iter().copied().collect();
        calculate_hrv(&rr)
    }

    /// Feed one filtered sample.
    ///
    /// Returns a [`Peak`] when a validated beat lands on this or the
    /// previous sample. Rejection (too little data, perfusion out of
    /// range, gates failed, refractory) is a silent no-op.
    pub fn process_sample(
        &mut self,
        value: f32,
        timestamp_ms: f64,
        perfusion_pct: Option<f32>,
    ) -> Option<Peak> {
        self.sample_index += 1;
        self.buffer.push_back(value);
        self.timestamps.push_back(timestamp_ms);
        while self.buffer.len() > self.config.buffer_capacity {
            self.buffer.pop_front();
            self.timestamps.pop_front();
        }

        if self.buffer.len() < self.config.min_samples {
            return None;
        }

        if let Some(p) = perfusion_pct {
            if p < self.config.min_perfusion_pct || p > self.config.max_perfusion_pct {
                return None;
            }
        }

        let window_len = self.config.window.min(self.buffer.len());
        let start = self.buffer.len() - window_len;
        let window: Vec<f32> = self.buffer.iter().skip(start).copied().collect();

        let mean = window.iter().sum::<f32>() / window_len as f32;
        let variance =
            window.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / window_len as f32;
        let std = variance.sqrt();
        if std < 1e-6 {
            return None;
        }

        let threshold = self.engine.double_envelope(&window);

        // Candidate: threshold up-crossing on the newest sample, or a
        // local maximum on the one before it.
        let i = window_len - 1;
        let crossing = i >= 1 && window[i] > threshold[i] && window[i - 1] <= threshold[i - 1];
        let local_max = i >= 2
            && window[i - 1] >= window[i - 2]
            && window[i - 1] >= window[i];

        let (amplitude, candidate_threshold, ts_offset) = if local_max {
            (window[i - 1], threshold[i - 1], 1)
        } else if crossing {
            (window[i], threshold[i], 0)
        } else {
            return None;
        };

        let timestamp = self.timestamps[self.timestamps.len() - 1 - ts_offset];

        if let Some(last) = self.last_peak_ms {
            if timestamp - last < self.config.refractory_ms as f64 {
                return None;
            }
        }

        let snr = (amplitude - mean) / std;
        let passes = amplitude > self.config.amplitude_threshold_ratio * candidate_threshold
            && amplitude > self.config.amplitude_mean_ratio * mean
            && snr > self.config.min_snr;
        if !passes {
            return None;
        }

        let rr_ms = self.last_peak_ms.map(|last| (timestamp - last) as f32);
        if let Some(rr) = rr_ms {
            if rr <= self.config.max_rr_ms {
                self.rr.push_back(rr);
                while self.rr.len() > self.config.rr_capacity {
                    self.rr.pop_front();
                }
                let instantaneous = 60_000.0 / rr;
                self.smoothed_bpm = if self.smoothed_bpm > 0.0 {
                    self.config.bpm_smoothing * self.smoothed_bpm
                        + (1.0 - self.config.bpm_smoothing) * instantaneous
                } else {
                    instantaneous
                };
            }
        }
        self.last_peak_ms = Some(timestamp);

        Some(Peak {
            index: self.sample_index - 1 - ts_offset as u64,
            timestamp_ms: timestamp,
            amplitude,
            confidence: (snr / 3.0).min(1.0),
            rr_ms: rr_ms.filter(|&rr| rr <= self.config.max_rr_ms),
        })
    }

    /// Offline detection over a complete finite signal.
    ///
    /// Timestamps default to `i * 1000 / sample_rate` when not supplied.
    pub fn detect_peaks(&self, signal: &Array1<f32>, timestamps: Option<&[f64]>) -> BatchDetection {
        let mut detector = PeakDetector::with_config(self.config.clone());
        let step_ms = 1000.0 / self.config.sample_rate as f64;

        let mut peaks = Vec::new();
        for (i, &x) in signal.iter().enumerate() {
            let ts = timestamps
                .and_then(|t| t.get(i).copied())
                .unwrap_or(i as f64 * step_ms);
            if let Some(peak) = detector.process_sample(x, ts, None) {
                peaks.push(peak);
            }
        }

        let rr_ms = detector.rr_history();
        let instantaneous_bpm = rr_ms.last().map(|&rr| 60_000.0 / rr).unwrap_or(0.0);
        let average_bpm = if rr_ms.is_empty() {
            0.0
        } else {
            60_000.0 / (rr_ms.iter().sum::<f32>() / rr_ms.len() as f32)
        };
        let hrv = calculate_hrv(&rr_ms);

        BatchDetection { peaks, rr_ms, instantaneous_bpm, average_bpm, hrv }
    }

    /// Clear all rolling state; configuration is kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.timestamps.clear();
        self.rr.clear();
        self.last_peak_ms = None;
        self.smoothed_bpm = 0.0;
        self.sample_index = 0;
    }
}

impl Default for PeakDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// HRV metrics over a slice of RR intervals in milliseconds.
///
/// Fewer than 3 intervals yields the all-zero summary, not an error.
pub fn calculate_hrv(rr_ms: &[f32]) -> HrvSummary {
    if rr_ms.len() < 3 {
        return HrvSummary::default();
    }

    let n = rr_ms.len() as f32;
    let mean = rr_ms.iter().sum::<f32>() / n;
    let sdnn_ms =
        (rr_ms.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n).sqrt();

    let mut diff_sq_sum = 0.0f32;
    let mut over_50 = 0usize;
    let diffs = rr_ms.len() - 1;
    for w in rr_ms.windows(2) {
        let d = w[1] - w[0];
        diff_sq_sum += d * d;
        if d.abs() > 50.0 {
            over_50 += 1;
        }
    }
    let rmssd_ms = (diff_sq_sum / diffs as f32).sqrt();
    let pnn50_pct = over_50 as f32 / diffs as f32 * 100.0;

    HrvSummary { sdnn_ms, rmssd_ms, pnn50_pct }
}
