//! End-to-end pipeline scenario: synthetic fingertip frames with a 1 Hz
//! pulsatile component, processed at 30 Hz.

use ppg_signals::{EventKind, PulsePipeline, SignalConfidence};
use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;

const FS: f64 = 30.0;
const WIDTH: u32 = 32;
const HEIGHT: u32 = 32;

/// Uniform frame simulating a fingertip over the lens: strong red, red/green
/// ratio near 2, with a small pulsatile modulation on both channels.
fn finger_frame(frame_index: usize) -> Vec<u8> {
    let t = frame_index as f64 / FS;
    let pulse = (2.0 * PI * 1.0 * t).sin();
    let red = (180.0 + 4.0 * pulse).round() as u8;
    let green = (90.0 + 2.0 * pulse).round() as u8;
    let blue = 60u8;

    let mut data = Vec::with_capacity((WIDTH * HEIGHT * 3) as usize);
    for _ in 0..WIDTH * HEIGHT {
        data.extend_from_slice(&[red, green, blue]);
    }
    data
}

#[test]
fn test_full_session_converges_to_60_bpm() {
    let mut pipeline = PulsePipeline::new();

    let peak_events = Rc::new(RefCell::new(0usize));
    let counter = peak_events.clone();
    pipeline.on(EventKind::PeakDetected, move |_| {
        *counter.borrow_mut() += 1;
    });

    pipeline.start();

    let mut finger_at: Option<usize> = None;
    let mut bpm_nonzero_at: Option<usize> = None;
    let mut last_result = None;

    for i in 0..450 {
        let frame = finger_frame(i);
        let result = pipeline
            .process_frame(&frame, WIDTH, HEIGHT, 3, i as f64 * 1000.0 / FS)
            .expect("pipeline is running");

        if result.finger_detected && finger_at.is_none() {
            finger_at = Some(i);
        }
        if result.smoothed_bpm > 0.0 && bpm_nonzero_at.is_none() {
            bpm_nonzero_at = Some(i);
        }
        last_result = Some(result);
    }

    let last = last_result.unwrap();

    // Instant calibration path: the finger is present from frame 0, so the
    // pipeline must be calibrated within the first few frames.
    assert!(pipeline.calibration().calibrated);

    // Finger debounce: detected after the 5-frame streak, not before.
    let finger_at = finger_at.expect("finger never detected");
    assert!(
        (4..=6).contains(&finger_at),
        "finger detected at frame {}, expected ~5",
        finger_at
    );

    // A rate estimate exists well before the end of the session.
    let bpm_at = bpm_nonzero_at.expect("BPM never became non-zero");
    assert!(bpm_at < 200, "first BPM at frame {}, expected < 200", bpm_at);

    // Converged near the 1 Hz pulsatile rate.
    assert!(
        (last.smoothed_bpm - 60.0).abs() < 10.0,
        "expected ~60 BPM, got {}",
        last.smoothed_bpm
    );

    // Recent RR intervals cluster near 1000 ms.
    let rr = &last.rr_history_ms;
    assert!(rr.len() >= 3, "expected several RR intervals, got {}", rr.len());
    let recent: Vec<f32> = rr.iter().rev().take(5).copied().collect();
    let mean_rr = recent.iter().sum::<f32>() / recent.len() as f32;
    assert!(
        (mean_rr - 1000.0).abs() < 120.0,
        "expected RR near 1000 ms, got {}",
        mean_rr
    );

    assert!(*peak_events.borrow() >= 5, "expected peak events");

    // A stable, well-perfused synthetic signal must not be flagged invalid.
    assert_ne!(last.confidence, SignalConfidence::Invalid);
    assert!(last.perfusion_index > 1.0 && last.perfusion_index < 15.0);

    // Both channels carry the same relative pulsatile amplitude, so the
    // ratio of ratios sits near 1 and SpO2 lands in the high 90s.
    assert!(
        last.spo2 >= 85.0 && last.spo2 <= 100.0,
        "unexpected SpO2 {}",
        last.spo2
    );
}

#[test]
fn test_no_finger_no_rate() {
    let mut pipeline = PulsePipeline::new();
    pipeline.start();

    // Dim, blue-ish frames: never plausible as a fingertip.
    let mut data = Vec::with_capacity((WIDTH * HEIGHT * 3) as usize);
    for _ in 0..WIDTH * HEIGHT {
        data.extend_from_slice(&[20, 25, 40]);
    }

    for i in 0..200 {
        let result = pipeline
            .process_frame(&data, WIDTH, HEIGHT, 3, i as f64 * 1000.0 / FS)
            .unwrap();
        assert!(!result.finger_detected);
        assert_eq!(result.smoothed_bpm, 0.0);
        assert!(!result.peak);
    }
}

#[test]
fn test_stop_halts_processing() {
    let mut pipeline = PulsePipeline::new();
    pipeline.start();
    let frame = finger_frame(0);
    assert!(pipeline.process_frame(&frame, WIDTH, HEIGHT, 3, 0.0).is_some());

    pipeline.stop();
    assert!(pipeline.process_frame(&frame, WIDTH, HEIGHT, 3, 33.3).is_none());

    pipeline.start();
    assert!(pipeline.process_frame(&frame, WIDTH, HEIGHT, 3, 66.6).is_some());
}
