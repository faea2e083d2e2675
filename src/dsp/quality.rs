//! Composite signal quality index (SQI) for PPG windows.
//!
//! Eight sub-scores are computed from the current window and an AC/DC
//! estimate, each mapped 0-100 through a fixed monotone step table, then
//! combined with fixed weights into a global score and a 4-level
//! confidence classification. The result is recomputed fresh every frame
//! and also carries the raw physical statistics each score derives from.
//!
//! Windows shorter than 30 samples, or with no variance at all, return the
//! all-zero `Invalid` result rather than failing.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

/// Minimum window length for a meaningful assessment (1 s at 30 Hz).
const MIN_WINDOW: usize = 30;

/// Histogram bins for the entropy index.
const ENTROPY_BINS: usize = 20;

/// Fixed sub-score weights; they sum to 1.0.
const W_PERFUSION: f32 = 0.25;
const W_SNR: f32 = 0.15;
const W_PERIODICITY: f32 = 0.15;
const W_ENTROPY: f32 = 0.12;
const W_SKEWNESS: f32 = 0.10;
const W_KURTOSIS: f32 = 0.10;
const W_ZERO_CROSSING: f32 = 0.08;
const W_STABILITY: f32 = 0.05;

/// Confidence classification derived from the global score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalConfidence {
    High,
    Medium,
    Low,
    Invalid,
}

impl SignalConfidence {
    fn from_score(score: f32) -> Self {
        if score >= 70.0 {
            SignalConfidence::High
        } else if score >= 50.0 {
            SignalConfidence::Medium
        } else if score >= 30.0 {
            SignalConfidence::Low
        } else {
            SignalConfidence::Invalid
        }
    }
}

/// Raw statistics behind the sub-scores.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SqiStats {
    /// AC/DC ratio in percent.
    pub perfusion_pct: f32,
    /// Third standardized moment.
    pub skewness: f32,
    /// Excess kurtosis (fourth standardized moment minus 3).
    pub kurtosis: f32,
    /// Shannon entropy normalized by log2(bins), 0-1.
    pub entropy: f32,
    /// (max - min) / std.
    pub snr: f32,
    /// Max normalized autocorrelation in the 40-180 BPM lag range.
    pub periodicity: f32,
    /// Mean-centered zero crossings per second.
    pub zero_crossing_rate: f32,
    /// 1 - coefficient of variation of per-second amplitude.
    pub stability: f32,
}

/// Full quality assessment for one window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqiResult {
    pub perfusion_score: f32,
    pub skewness_score: f32,
    pub kurtosis_score: f32,
    pub entropy_score: f32,
    pub snr_score: f32,
    pub periodicity_score: f32,
    pub zero_crossing_score: f32,
    pub stability_score: f32,
    /// Weighted aggregate, 0-100.
    pub global_sqi: f32,
    pub confidence: SignalConfidence,
    /// `global_sqi >= 30`.
    pub is_valid: bool,
    pub stats: SqiStats,
}

impl SqiResult {
    /// The neutral result for windows that cannot be assessed.
    pub fn invalid() -> Self {
        Self {
            perfusion_score: 0.0,
            skewness_score: 0.0,
            kurtosis_score: 0.0,
            entropy_score: 0.0,
            snr_score: 0.0,
            periodicity_score: 0.0,
            zero_crossing_score: 0.0,
            stability_score: 0.0,
            global_sqi: 0.0,
            confidence: SignalConfidence::Invalid,
            is_valid: false,
            stats: SqiStats::default(),
        }
    }
}

/// Signal quality validator.
#[derive(Debug, Clone)]
pub struct SqiValidator {
    sample_rate: f32,
}

impl SqiValidator {
    pub fn new() -> Self {
        Self::with_sample_rate(30.0)
    }

    pub fn with_sample_rate(sample_rate: f32) -> Self {
        Self { sample_rate: sample_rate.max(1e-3) }
    }

    /// Assess one window given the AC/DC estimates for its channel.
    pub fn validate(&self, signal: &Array1<f32>, ac: f32, dc: f32) -> SqiResult {
        let n = signal.len();
        if n < MIN_WINDOW {
            return SqiResult::invalid();
        }

        let mean = signal.mean().unwrap_or(0.0);
        let variance = signal.mapv(|x| (x - mean).powi(2)).mean().unwrap_or(0.0);
        let std = variance.sqrt();
        if std < 1e-6 {
            return SqiResult::invalid();
        }

        let stats = SqiStats {
            perfusion_pct: if dc.abs() > 1e-6 { ac / dc * 100.0 } else { 0.0 },
            skewness: standardized_moment(signal, mean, std, 3),
            kurtosis: standardized_moment(signal, mean, std, 4) - 3.0,
            entropy: normalized_entropy(signal),
            snr: {
                let max = signal.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
                let min = signal.fold(f32::INFINITY, |a, &b| a.min(b));
                (max - min) / std
            },
            periodicity: self.periodicity(signal, mean, variance),
            zero_crossing_rate: self.zero_crossing_rate(signal, mean),
            stability: self.segment_stability(signal),
        };

        let perfusion_score = score_perfusion(stats.perfusion_pct);
        let skewness_score = score_skewness(stats.skewness);
        let kurtosis_score = score_kurtosis(stats.kurtosis);
        let entropy_score = score_entropy(stats.entropy);
        let snr_score = score_snr(stats.snr);
        let periodicity_score = score_periodicity(stats.periodicity);
        let zero_crossing_score = score_zero_crossing(stats.zero_crossing_rate);
        let stability_score = score_stability(stats.stability);

        let global_sqi = perfusion_score * W_PERFUSION
            + snr_score * W_SNR
            + periodicity_score * W_PERIODICITY
            + entropy_score * W_ENTROPY
            + skewness_score * W_SKEWNESS
            + kurtosis_score * W_KURTOSIS
            + zero_crossing_score * W_ZERO_CROSSING
            + stability_score * W_STABILITY;

        SqiResult {
            perfusion_score,
            skewness_score,
            kurtosis_score,
            entropy_score,
            snr_score,
            periodicity_score,
            zero_crossing_score,
            stability_score,
            global_sqi,
            confidence: SignalConfidence::from_score(global_sqi),
            is_valid: global_sqi >= 30.0,
            stats,
        }
    }

    /// Max normalized autocorrelation over lags corresponding to 40-180 BPM.
    fn periodicity(&self, signal: &Array1<f32>, mean: f32, variance: f32) -> f32 {
        let n = signal.len();
        if variance < 1e-12 {
            return 0.0;
        }

        let min_lag = (self.sample_rate * 60.0 / 180.0).round() as usize;
        let max_lag = ((self.sample_rate * 60.0 / 40.0).round() as usize).min(n - 1);
        if min_lag == 0 || min_lag > max_lag {
            return 0.0;
        }

        let mut best = 0.0f32;
        for lag in min_lag..=max_lag {
            let mut acc = 0.0f32;
            for i in 0..n - lag {
                acc += (signal[i] - mean) * (signal[i + lag] - mean);
            }
            let r = acc / ((n - lag) as f32 * variance);
            if r > best {
                best = r;
            }
        }
        best.clamp(0.0, 1.0)
    }

    /// Mean-centered zero crossings per second.
    fn zero_crossing_rate(&self, signal: &Array1<f32>, mean: f32) -> f32 {
        let mut crossings = 0usize;
        for w in signal.windows(2) {
            let a = w[0] - mean;
            let b = w[1] - mean;
            if (a <= 0.0 && b > 0.0) || (a >= 0.0 && b < 0.0) {
                crossings += 1;
            }
        }
        crossings as f32 * self.sample_rate / signal.len() as f32
    }

    /// 1 - CV of per-second peak-to-peak amplitude across >= 2 segments.
    fn segment_stability(&self, signal: &Array1<f32>) -> f32 {
        let seg = self.sample_rate.round() as usize;
        if seg == 0 || signal.len() < 2 * seg {
            return 0.0;
        }

        let mut amplitudes = Vec::new();
        let slice = signal.as_slice().unwrap_or(&[]);
        for chunk in slice.chunks_exact(seg) {
            let max = chunk.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            let min = chunk.iter().fold(f32::INFINITY, |a, &b| a.min(b));
            amplitudes.push(max - min);
        }
        if amplitudes.len() < 2 {
            return 0.0;
        }

        let mean = amplitudes.iter().sum::<f32>() / amplitudes.len() as f32;
        if mean < 1e-9 {
            return 0.0;
        }
        let var = amplitudes.iter().map(|a| (a - mean).powi(2)).sum::<f32>()
            / amplitudes.len() as f32;
        (1.0 - var.sqrt() / mean).clamp(0.0, 1.0)
    }
}

impl Default for SqiValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn standardized_moment(signal: &Array1<f32>, mean: f32, std: f32, order: i32) -> f32 {
    signal
        .mapv(|x| ((x - mean) / std).powi(order))
        .mean()
        .unwrap_or(0.0)
}

/// Shannon entropy over up to 20 histogram bins, normalized by log2(bins).
fn normalized_entropy(signal: &Array1<f32>) -> f32 {
    let n = signal.len();
    let bins = ENTROPY_BINS.min(n);
    if bins < 2 {
        return 1.0;
    }

    let max = signal.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let min = signal.fold(f32::INFINITY, |a, &b| a.min(b));
    let range = max - min;
    if range < 1e-12 {
        return 0.0;
    }

    let mut counts = vec![0usize; bins];
    for &x in signal.iter() {
        let idx = (((x - min) / range) * bins as f32) as usize;
        counts[idx.min(bins - 1)] += 1;
    }

    let mut entropy = 0.0f32;
    for &c in &counts {
        if c > 0 {
            let p = c as f32 / n as f32;
            entropy -= p * p.log2();
        }
    }
    entropy / (bins as f32).log2()
}

// Monotone step tables. Empirically tuned; see the crate-level notes on
// tuned constants.

fn score_perfusion(pct: f32) -> f32 {
    if pct < 0.05 {
        0.0
    } else if pct < 0.5 {
        20.0
    } else if pct < 1.0 {
        40.0
    } else if pct < 3.0 {
        70.0
    } else if pct <= 10.0 {
        100.0
    } else if pct <= 15.0 {
        70.0
    } else if pct <= 20.0 {
        40.0
    } else {
        20.0
    }
}

fn score_skewness(skew: f32) -> f32 {
    let s = skew.abs();
    if s < 0.5 {
        100.0
    } else if s < 1.0 {
        80.0
    } else if s < 1.5 {
        60.0
    } else if s < 2.0 {
        40.0
    } else if s < 3.0 {
        15.0
    } else {
        0.0
    }
}

fn score_kurtosis(excess: f32) -> f32 {
    let k = excess.abs();
    if k < 0.5 {
        100.0
    } else if k < 1.0 {
        85.0
    } else if k < 2.0 {
        65.0
    } else if k < 3.0 {
        40.0
    } else if k < 5.0 {
        20.0
    } else {
        0.0
    }
}

fn score_entropy(normalized: f32) -> f32 {
    // Lower entropy = more periodic = better.
    if normalized < 0.5 {
        100.0
    } else if normalized < 0.6 {
        85.0
    } else if normalized < 0.7 {
        70.0
    } else if normalized < 0.8 {
        50.0
    } else if normalized < 0.9 {
        30.0
    } else {
        10.0
    }
}

fn score_snr(snr: f32) -> f32 {
    if snr < 1.0 {
        0.0
    } else if snr < 2.0 {
        30.0
    } else if snr < 3.0 {
        60.0
    } else if snr <= 15.0 {
        100.0
    } else if snr <= 25.0 {
        60.0
    } else {
        30.0
    }
}

fn score_periodicity(r: f32) -> f32 {
    if r >= 0.8 {
        100.0
    } else if r >= 0.6 {
        80.0
    } else if r >= 0.4 {
        60.0
    } else if r >= 0.3 {
        40.0
    } else if r >= 0.2 {
        20.0
    } else {
        0.0
    }
}

fn score_zero_crossing(rate_hz: f32) -> f32 {
    if (2.0..=6.0).contains(&rate_hz) {
        100.0
    } else if (1.0..2.0).contains(&rate_hz) || (6.0..=8.0).contains(&rate_hz) {
        60.0
    } else if (0.5..1.0).contains(&rate_hz) || (8.0..=10.0).contains(&rate_hz) {
        30.0
    } else {
        0.0
    }
}

fn score_stability(stability: f32) -> f32 {
    if stability >= 0.8 {
        100.0
    } else if stability >= 0.6 {
        75.0
    } else if stability >= 0.4 {
        50.0
    } else if stability >= 0.2 {
        25.0
    } else {
        0.0
    }
}
