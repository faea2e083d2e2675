//! # ppg-signals
//!
//! Contact photoplethysmography (PPG) signal processing.
//!
//! This crate extracts a pulse waveform from per-frame RGB averages of a
//! camera region of interest and turns it into heart rate, SpO2, HRV and a
//! composite signal-quality rating, in real time at camera rates (~30 Hz).
//!
//! Components:
//! - **Channel calibration**: offset/gain/gamma correction of raw averages
//! - **Band-pass filtering**: Butterworth biquad cascade (0.4-4.5 Hz)
//! - **Hilbert engine**: analytic signal, envelope, instantaneous frequency
//! - **Peak detection**: adaptive double-envelope thresholding + HRV
//! - **Quality validation**: eight weighted indices and a confidence level
//! - **Pipeline**: per-frame orchestration, finger gating, SpO2, events
//!
//! ## Example
//!
//! ```ignore
//! use ppg_signals::{PulsePipeline, PipelineConfig};
//!
//! let mut pipeline = PulsePipeline::new();
//! pipeline.start();
//!
//! for frame in camera_frames {
//!     if let Some(result) = pipeline.process_frame(
//!         &frame.data, frame.width, frame.height, 3, frame.timestamp_ms,
//!     ) {
//!         println!("BPM {:.1} SpO2 {} ({:?})",
//!             result.smoothed_bpm, result.spo2, result.confidence);
//!     }
//! }
//! ```

pub mod calibration;
pub mod dsp;
pub mod pipeline;

pub use calibration::{CalibrationState, ChannelCalibrator};
pub use dsp::filters::{BandpassFilter, FilterConfig, FilterOrder};
pub use dsp::hilbert::{AnalyticSignal, HilbertEngine};
pub use dsp::peaks::{calculate_hrv, BatchDetection, HrvSummary, Peak, PeakConfig, PeakDetector};
pub use dsp::quality::{SignalConfidence, SqiResult, SqiStats, SqiValidator};
pub use pipeline::{
    EventKind, FingerConfig, FrameResult, PipelineConfig, PipelineEvent, PipelineState,
    PulsePipeline, Spo2Config,
};
