//! Digital signal processing for PPG waveforms.
//!
//! - [`filters`]: Butterworth band-pass biquad cascade
//! - [`hilbert`]: analytic signal and double-envelope thresholds
//! - [`peaks`]: streaming/batch beat detection and HRV
//! - [`quality`]: composite signal quality index

pub mod filters;
pub mod hilbert;
pub mod peaks;
pub mod quality;

pub use filters::{BandpassFilter, FilterConfig, FilterOrder};
pub use hilbert::{AnalyticSignal, HilbertEngine};
pub use peaks::{BatchDetection, HrvSummary, Peak, PeakConfig, PeakDetector};
pub use quality::{SignalConfidence, SqiResult, SqiStats, SqiValidator};
