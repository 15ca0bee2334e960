//! End-to-end integration tests for the acquisition pipeline.
//!
//! These tests exercise the full data flow:
//!   SimulatedDevice / trace file → Coordinator (decoder, ring, filters,
//!   spectrum, recorder) → read-only views

use std::f64::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use myo_capture::config::PipelineConfig;
use myo_capture::coordinator::{Coordinator, Mode};
use myo_capture::decoder::FrameDecoder;
use myo_capture::error::FormatError;
use myo_capture::playback::Trace;
use myo_capture::recorder::{TraceHeader, HEADER_SIZE, RECORD_SIZE};
use myo_capture::simulator::SimulatedDevice;
use myo_capture::transport::ByteSource;
use myo_capture::types::*;

// ─── Helpers ───────────────────────────────────────────────────────────────

fn config(channels: usize) -> PipelineConfig {
    PipelineConfig {
        channel_count: channels,
        window_seconds: 4.0,
        ..PipelineConfig::default()
    }
}

/// Write a trace whose channel `ch` carries a sine at `freq + 10·ch` Hz.
fn write_sine_trace(dir: &Path, name: &str, freq: f64, fs: u16, samples: usize) -> PathBuf {
    let header = TraceHeader::new(AdcBits::B10, fs as f64, [Gain::X1; MAX_CHANNELS]);
    let mut buf = Vec::new();
    header.write_to(&mut buf).unwrap();
    for i in 0..samples {
        let t = i as f64 / fs as f64;
        for ch in 0..MAX_CHANNELS {
            let f = freq + 10.0 * ch as f64;
            let v = 512.0 + 200.0 * (2.0 * PI * f * t).sin();
            buf.extend_from_slice(&(v.round() as u16).to_le_bytes());
        }
    }
    let path = dir.join(name);
    fs::write(&path, buf).unwrap();
    path
}

/// Everything a reader of the ring can observe.
fn ring_state(c: &Coordinator, channels: usize) -> (usize, Vec<f64>, Vec<Vec<f64>>, Vec<Vec<f64>>) {
    (
        c.ring().cursor(),
        c.times().to_vec(),
        (0..channels).map(|ch| c.ring().channel(ch).to_vec()).collect(),
        (0..channels).map(|ch| c.filtered(ch).to_vec()).collect(),
    )
}

// ─── Wire protocol ─────────────────────────────────────────────────────────

#[test]
fn test_five_frame_burst() {
    let mut bytes = Vec::new();
    for i in 0..5u16 {
        bytes.extend_from_slice(&(10 + i).to_le_bytes());
        bytes.extend_from_slice(&(20 + i).to_le_bytes());
        bytes.extend_from_slice(&500u16.to_le_bytes());
    }
    bytes.extend_from_slice(&[0xFF, 0xFF]);

    let mut dec = FrameDecoder::new(2);
    let frames = dec.decode(&bytes);
    assert_eq!(frames.len(), 5);
    for (i, f) in frames.iter().enumerate() {
        assert_eq!(f.active(), &[10 + i as u16, 20 + i as u16]);
        assert_eq!(f.dt_us, 500);
    }
    assert!(dec.carry_over().is_empty());
}

#[test]
fn test_byte_conservation_across_odd_reads() {
    let mut dev = SimulatedDevice::new(3, 2000.0).deterministic(37, 11);
    let mut stream = Vec::new();
    for _ in 0..20 {
        stream.extend(dev.read_available());
    }
    let mut dec = FrameDecoder::new(3);
    let mut frames = 0;
    for chunk in stream.chunks(29) {
        frames += dec.decode(chunk).len();
    }
    let stats = dec.stats();
    assert_eq!(frames, 20 * 37);
    assert_eq!(
        frames * frame_size(3) + stats.markers as usize * 2 + stats.dropped_bytes as usize
            + dec.carry_over().len(),
        stream.len()
    );
}

// ─── Live path ─────────────────────────────────────────────────────────────

#[test]
fn test_simulated_live_session() {
    let mut c = Coordinator::new(config(4), std::env::temp_dir());
    c.start_live(Box::new(SimulatedDevice::new(4, 2000.0).deterministic(200, 5)));
    assert_eq!(c.mode(), Mode::Live);

    for _ in 0..20 {
        assert_eq!(c.tick().samples, 200);
    }
    assert_eq!(c.ring().filled(), 4000);
    assert_eq!(c.decode_stats().sync_errors, 0);
    for ch in 0..4 {
        assert!(c.latest_envelope(ch) > 0.0, "channel {} envelope", ch);
    }
    assert!(c.spectrum_peak().is_some());
    assert_eq!(c.spectrum().len(), 666);

    c.stop_live();
    assert_eq!(c.mode(), Mode::Idle);
    assert_eq!(c.tick().samples, 0);
}

// ─── Record → playback ─────────────────────────────────────────────────────

#[test]
fn test_record_then_playback_is_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let mut c = Coordinator::new(config(2), dir.path());
    c.set_gain(1, Gain::X8);
    c.start_live(Box::new(SimulatedDevice::new(2, 2000.0).deterministic(160, 9)));
    let path = c.start_recording().unwrap();
    for _ in 0..10 {
        c.tick();
    }
    let summary = c.stop_recording().unwrap().unwrap();
    assert_eq!(summary.samples, 1600);
    assert_eq!(summary.binary_path, path);

    // Same seed, same bytes: decode the reference sequence directly.
    let mut reference = SimulatedDevice::new(2, 2000.0).deterministic(160, 9);
    reference.send_command(gain_command(1, Gain::X8));
    let mut dec = FrameDecoder::new(2);
    let mut expected = Vec::new();
    for _ in 0..10 {
        expected.extend(dec.decode(&reference.read_available()));
    }

    let trace = Trace::load(&path).unwrap();
    assert_eq!(trace.count(), 1600);
    assert_eq!(trace.header().sampling_freq_hz, 2000);
    assert_eq!(trace.header().adc_bits, AdcBits::B10);
    assert_eq!(trace.header().gains[1], Gain::X8);
    for (i, f) in expected.iter().enumerate() {
        assert_eq!(trace.record(i), f.raw, "sample {}", i);
    }

    let text = fs::read_to_string(&summary.text_path).unwrap();
    assert_eq!(text.lines().filter(|l| l.starts_with("0.")).count(), 1600);
}

#[test]
fn test_replay_matches_live_ring() {
    let dir = tempfile::tempdir().unwrap();
    let mut live = Coordinator::new(config(1), dir.path());
    live.start_live(Box::new(SimulatedDevice::new(1, 2000.0).deterministic(160, 21)));
    let path = live.start_recording().unwrap();
    for _ in 0..15 {
        live.tick();
    }
    live.stop_recording().unwrap();

    let mut replay = Coordinator::new(config(1), dir.path());
    replay.start_playback(&path).unwrap();
    assert_eq!(replay.replay_step(), 160);
    for _ in 0..15 {
        replay.tick();
    }

    assert_eq!(ring_state(&live, 1), ring_state(&replay, 1));
    assert_eq!(live.envelope(0).to_vec(), replay.envelope(0).to_vec());
}

#[test]
fn test_text_twin_replays_like_binary() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(2);
    cfg.signal_unit = SignalUnit::Millivolts;
    let mut live = Coordinator::new(cfg.clone(), dir.path());
    live.set_gain(0, Gain::X16);
    live.start_live(Box::new(SimulatedDevice::new(2, 2000.0).deterministic(160, 5)));
    live.start_recording().unwrap();
    for _ in 0..8 {
        live.tick();
    }
    let summary = live.stop_recording().unwrap().unwrap();

    let mut from_bin = Coordinator::new(cfg.clone(), dir.path());
    from_bin.start_playback(&summary.binary_path).unwrap();
    let mut from_text = Coordinator::new(cfg, dir.path());
    from_text.start_playback(&summary.text_path).unwrap();
    for _ in 0..6 {
        from_bin.tick();
        from_text.tick();
    }

    assert_eq!(from_text.config().gains[0], Gain::X16);
    assert_eq!(ring_state(&from_text, 2), ring_state(&from_bin, 2));
}

#[test]
fn test_recording_during_playback() {
    let dir = tempfile::tempdir().unwrap();
    let src = write_sine_trace(dir.path(), "src.bin", 60.0, 1000, 3000);
    let out = dir.path().join("out");
    let mut c = Coordinator::new(config(1), &out);
    c.start_playback(&src).unwrap();
    c.start_recording().unwrap();
    for _ in 0..5 {
        c.tick();
    }
    let summary = c.stop_recording().unwrap().unwrap();
    assert_eq!(summary.samples, 5 * c.replay_step() as u64);

    let original = Trace::load(&src).unwrap();
    let copy = Trace::load(&summary.binary_path).unwrap();
    assert_eq!(copy.header(), original.header());
    for i in 0..copy.count() {
        assert_eq!(copy.record(i), original.record(i));
    }
}

// ─── Playback engine ───────────────────────────────────────────────────────

#[test]
fn test_seek_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sine_trace(dir.path(), "t.bin", 40.0, 2000, 20_000);
    let mut c = Coordinator::new(config(3), dir.path());
    c.start_playback(&path).unwrap();
    for _ in 0..7 {
        c.tick();
    }

    assert_eq!(c.seek(37.5), Some(7500));
    for _ in 0..4 {
        c.tick();
    }
    let first = ring_state(&c, 3);

    for _ in 0..9 {
        c.tick();
    }
    assert_eq!(c.seek(37.5), Some(7500));
    for _ in 0..4 {
        c.tick();
    }
    assert_eq!(ring_state(&c, 3), first);
    assert_eq!(first.1.last().copied(), Some((7500 + 4 * 200 - 1) as f64 / 2000.0));
}

#[test]
fn test_playback_loops_at_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sine_trace(dir.path(), "short.bin", 50.0, 1000, 100);
    let mut c = Coordinator::new(config(1), dir.path());
    c.start_playback(&path).unwrap();
    assert_eq!(c.replay_step(), 80);
    c.tick();
    assert_eq!(c.playback_position(), Some(80.0));
    // 20 samples, rewind, then 59 more from the start
    c.tick();
    assert_eq!(c.ring().filled(), 59);
    assert_eq!(c.times().last(), Some(58.0 / 1000.0));
    assert_eq!(c.playback_position(), Some(59.0));
}

#[test]
fn test_bad_trace_leaves_state_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let good = write_sine_trace(dir.path(), "good.bin", 30.0, 2000, 5000);
    let mut c = Coordinator::new(config(2), dir.path());
    c.start_playback(&good).unwrap();
    for _ in 0..5 {
        c.tick();
    }
    let before = ring_state(&c, 2);
    let position = c.playback_position();

    // Header only: zero records.
    let empty = dir.path().join("empty.bin");
    let mut buf = Vec::new();
    TraceHeader::new(AdcBits::B12, 1000.0, [Gain::X1; MAX_CHANNELS])
        .write_to(&mut buf)
        .unwrap();
    fs::write(&empty, &buf).unwrap();
    assert!(matches!(c.start_playback(&empty), Err(FormatError::Empty)));

    // One record plus a stray byte.
    buf.extend_from_slice(&[0u8; RECORD_SIZE + 1]);
    let ragged = dir.path().join("ragged.bin");
    fs::write(&ragged, &buf).unwrap();
    assert!(matches!(
        c.start_playback(&ragged),
        Err(FormatError::MisalignedBody { body_len }) if body_len == RECORD_SIZE + 1
    ));
    assert_eq!(fs::metadata(&ragged).unwrap().len() as usize, HEADER_SIZE + RECORD_SIZE + 1);

    assert_eq!(c.mode(), Mode::Replay);
    assert_eq!(c.config().adc_bits, AdcBits::B10);
    assert_eq!(c.playback_position(), position);
    assert_eq!(ring_state(&c, 2), before);
}

// ─── Spectrum ──────────────────────────────────────────────────────────────

#[test]
fn test_spectral_peak_of_replayed_sinusoid() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sine_trace(dir.path(), "sine.bin", 150.0, 2000, 20_000);
    let mut cfg = config(1);
    cfg.filter.bandpass.enabled = false;
    let mut c = Coordinator::new(cfg, dir.path());
    c.start_playback(&path).unwrap();
    for _ in 0..60 {
        c.tick();
    }
    let peak = c.spectrum_peak().unwrap();
    let bin = 2000.0 / 2000.0;
    assert!((peak - 150.0).abs() <= bin, "peak at {} Hz", peak);
    let freqs = c.spectrum_frequencies();
    assert_eq!(freqs.len(), c.spectrum().len());
}

// ─── Commands ──────────────────────────────────────────────────────────────

#[test]
fn test_refresh_clears_pipeline_but_keeps_source() {
    let mut c = Coordinator::new(config(1), std::env::temp_dir());
    c.start_live(Box::new(SimulatedDevice::new(1, 2000.0).deterministic(100, 2)));
    for _ in 0..5 {
        c.tick();
    }
    let t = c.times().last().unwrap();
    c.refresh();
    assert_eq!(c.ring().filled(), 0);
    assert_eq!(c.mode(), Mode::Live);
    assert!(c.times().iter().all(|v| v == t));
    assert_eq!(c.tick().samples, 100);
}

#[test]
fn test_millivolt_mode_centres_on_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_sine_trace(dir.path(), "mv.bin", 20.0, 2000, 4000);
    let mut cfg = config(1);
    cfg.signal_unit = SignalUnit::Millivolts;
    let mut c = Coordinator::new(cfg, dir.path());
    c.start_playback(&path).unwrap();
    for _ in 0..20 {
        c.tick();
    }
    let raw = c.ring().channel(0).to_vec();
    let max = raw.iter().cloned().fold(f64::MIN, f64::max);
    // 200 counts of a 10-bit ADC at x1 ≈ 977 mV
    assert!((max - 977.5).abs() < 10.0, "max {}", max);
    assert!(raw.iter().all(|v| v.abs() < 1000.0));
}
