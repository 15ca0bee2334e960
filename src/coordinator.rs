use crate::config::{FilterParams, PipelineConfig};
use crate::decoder::FrameDecoder;
use crate::error::{DecodeStats, FormatError};
use crate::filter::FilterPipeline;
use crate::playback::{PlaybackSession, Step, Trace};
use crate::recorder::{Recorder, RecordingSummary, TraceHeader};
use crate::ring::{RateDecision, RateEstimator, RingView, SampleRing};
use crate::spectrum::{SpectralEstimator, SPECTRUM_LEN};
use crate::transport::ByteSource;
use crate::types::*;
use log::{debug, info, trace, warn};
use std::io;
use std::path::{Path, PathBuf};

/// Relative change in the measured rate worth adopting without a reset.
/// Smaller wobble is ignored so the filters are not redesigned every tick.
const RATE_UPDATE_THRESHOLD: f64 = 0.01;

/// Where samples come from.
pub enum Source {
    Idle,
    Live(Box<dyn ByteSource>),
    Replay(PlaybackSession),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    Live,
    Replay,
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickReport {
    /// Samples written to the ring.
    pub samples: usize,
    /// True when the ring was resized for a new sampling rate.
    pub resized: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorStats {
    pub ticks: u64,
    pub samples: u64,
    pub resets: u64,
    pub record_errors: u64,
}

/// Owns the whole pipeline and drives it one tick at a time.
///
/// Each tick pulls whatever the current [`Source`] has, pushes every sample
/// through one ingest path (ring, then recorder if recording), then runs the
/// filter pipeline and the spectral estimator over the ring. Everything runs
/// on the caller's thread; the only cross-thread handoff is inside a
/// [`ThreadedSource`](crate::transport::ThreadedSource), if one is used.
pub struct Coordinator {
    config: PipelineConfig,
    source: Source,
    decoder: FrameDecoder,
    ring: SampleRing,
    rate: RateEstimator,
    rate_hz: f64,
    filters: FilterPipeline,
    spectrum: SpectralEstimator,
    recorder: Option<Recorder>,
    output_dir: PathBuf,
    /// Live session clock in µs; `None` until the first frame.
    live_us: Option<u64>,
    paused: bool,
    stats: CoordinatorStats,
}

impl Coordinator {
    pub fn new(config: PipelineConfig, output_dir: impl Into<PathBuf>) -> Self {
        let config = config.sanitized();
        let rate_hz = config.nominal_rate_hz;
        let capacity = SampleRing::capacity_for(rate_hz, config.window_seconds);
        let baseline = config.baseline();
        Self {
            decoder: FrameDecoder::new(config.channel_count),
            ring: SampleRing::new(capacity, baseline),
            rate: RateEstimator::default(),
            rate_hz,
            filters: FilterPipeline::new(capacity, baseline),
            spectrum: SpectralEstimator::new(SPECTRUM_LEN),
            recorder: None,
            output_dir: output_dir.into(),
            live_us: None,
            paused: false,
            stats: CoordinatorStats::default(),
            source: Source::Idle,
            config,
        }
    }

    // ─── Tick ───────────────────────────────────────────────────────────────

    /// One processing cycle. Never blocks and never fails: transport and
    /// decode faults just mean fewer samples this time.
    pub fn tick(&mut self) -> TickReport {
        if self.paused {
            return TickReport::default();
        }
        let report = match self.source {
            Source::Idle => TickReport::default(),
            Source::Live(_) => self.pull_live(),
            Source::Replay(_) => self.pull_replay(),
        };

        self.filters.run(
            &mut self.ring,
            &self.config.filter,
            self.config.channel_count,
            self.rate_hz,
        );
        if report.samples > 0 {
            let ch = self.config.selected_channel;
            self.spectrum.update(
                self.filters.filtered(ch),
                ch,
                self.config.spectrum_beta,
                self.rate_hz,
            );
        }

        self.stats.ticks += 1;
        self.stats.samples += report.samples as u64;
        if self.stats.ticks % 100 == 0 {
            debug!(
                "Coordinator: {} ticks, {} samples, {:.1} Hz",
                self.stats.ticks, self.stats.samples, self.rate_hz
            );
        }
        report
    }

    fn pull_live(&mut self) -> TickReport {
        let bytes = match &mut self.source {
            Source::Live(src) => src.read_available(),
            _ => return TickReport::default(),
        };
        let frames = self.decoder.decode(&bytes);
        for frame in &frames {
            let us = match self.live_us {
                None => 0,
                Some(prev) => prev + frame.dt_us as u64,
            };
            self.live_us = Some(us);
            if us > 0 {
                self.rate.observe(frame.dt_us as f64 * 1e-6);
            }
            self.ingest(Sample {
                time: us as f64 / 1e6,
                raw: frame.raw,
            });
        }
        trace!("Live: {} bytes → {} frames", bytes.len(), frames.len());
        let resized = self.check_rate();
        TickReport {
            samples: frames.len(),
            resized,
        }
    }

    fn pull_replay(&mut self) -> TickReport {
        let n = self.replay_step();
        let mut written = 0;
        for _ in 0..n {
            let step = match &mut self.source {
                Source::Replay(session) => session.advance(),
                _ => break,
            };
            match step {
                Step::Sample(s) => {
                    self.ingest(s);
                    written += 1;
                }
                Step::Rewound => {
                    debug!("Playback: end of trace, looping");
                    self.restart_ring(0.0);
                }
            }
        }
        TickReport {
            samples: written,
            resized: false,
        }
    }

    /// Samples replayed per tick so playback runs at the recorded rate.
    pub fn replay_step(&self) -> usize {
        (self.rate_hz * self.config.tick_interval().as_secs_f64()).round() as usize
    }

    /// The single path from a sample to the ring and the recorder.
    fn ingest(&mut self, sample: Sample) {
        let mut values = [self.config.baseline(); MAX_CHANNELS];
        for (ch, v) in values.iter_mut().enumerate().take(self.config.channel_count) {
            *v = self.config.convert(ch, sample.raw[ch]);
        }
        self.ring.write(sample.time, &values);

        let failed = match self.recorder.as_mut() {
            Some(rec) => rec.append_sample(sample.time, &sample.raw, &values).err(),
            None => None,
        };
        if let Some(e) = failed {
            warn!("Recording aborted: {}", e);
            self.stats.record_errors += 1;
            self.recorder = None;
        }
    }

    /// Compare the measured rate with the nominal one. Returns true if the
    /// ring was resized.
    fn check_rate(&mut self) -> bool {
        if self.recorder.is_some() {
            // The trace header already carries the rate; keep it truthful.
            return false;
        }
        match self.rate.assess(self.rate_hz) {
            RateDecision::Drift(measured) => {
                info!(
                    "Sampling rate {:.1} Hz drifted from {:.1} Hz, resizing ring",
                    measured, self.rate_hz
                );
                self.rate_hz = measured;
                self.full_reset(self.ring.last_time());
                true
            }
            RateDecision::Stable(measured) => {
                if (measured - self.rate_hz).abs() / self.rate_hz > RATE_UPDATE_THRESHOLD {
                    debug!("Sampling rate updated to {:.1} Hz", measured);
                    self.rate_hz = measured;
                }
                false
            }
            RateDecision::Unknown => false,
        }
    }

    // ─── Resets ─────────────────────────────────────────────────────────────

    /// Clear the ring at the current capacity. Filters and spectrum follow.
    fn restart_ring(&mut self, origin: f64) {
        self.ring.reset(self.config.baseline(), origin);
        self.spectrum.reset();
        self.stats.resets += 1;
    }

    /// Reallocate the ring for the current rate and forget the rate estimate.
    fn full_reset(&mut self, origin: f64) {
        let capacity = SampleRing::capacity_for(self.rate_hz, self.config.window_seconds);
        self.ring.resize(capacity, self.config.baseline(), origin);
        self.rate.reset();
        self.spectrum.reset();
        self.stats.resets += 1;
    }

    fn send(&mut self, byte: u8) {
        if let Source::Live(src) = &mut self.source {
            src.send_command(byte);
        }
    }

    // ─── Commands ───────────────────────────────────────────────────────────

    pub fn set_paused(&mut self, paused: bool) {
        if paused != self.paused {
            info!("{}", if paused { "Paused" } else { "Resumed" });
        }
        self.paused = paused;
    }

    /// Reinitialise ring, filters, spectrum and decoder carry-over. The
    /// source is left alone.
    pub fn refresh(&mut self) {
        self.decoder.reset();
        self.rate.reset();
        self.restart_ring(self.ring.last_time());
    }

    pub fn set_channel_count(&mut self, count: usize) {
        let count = count.clamp(1, MAX_CHANNELS);
        if count == self.config.channel_count {
            return;
        }
        info!("Channel count {} → {}", self.config.channel_count, count);
        self.config.channel_count = count;
        self.config.selected_channel = self.config.selected_channel.min(count - 1);
        self.send(channel_count_command(count));
        self.decoder.set_channel_count(count);
        self.rate.reset();
        self.restart_ring(self.ring.last_time());
    }

    pub fn set_gain(&mut self, channel: usize, gain: Gain) {
        if channel >= MAX_CHANNELS {
            warn!("Ignoring gain for channel {}", channel);
            return;
        }
        self.config.gains[channel] = gain;
        self.send(gain_command(channel, gain));
        if self.config.signal_unit == SignalUnit::Millivolts {
            // Stored values were scaled by the old gain.
            self.restart_ring(self.ring.last_time());
        }
    }

    /// A new ADC resolution invalidates every stored value and the baseline,
    /// so the pipeline starts over.
    pub fn set_adc_bits(&mut self, adc: AdcBits) {
        if adc != self.config.adc_bits {
            self.config.adc_bits = adc;
            self.full_reset(self.ring.last_time());
        }
    }

    pub fn set_signal_unit(&mut self, unit: SignalUnit) {
        if unit != self.config.signal_unit {
            self.config.signal_unit = unit;
            self.restart_ring(self.ring.last_time());
        }
    }

    /// Takes effect on the next tick; the filter pipeline notices which parts
    /// changed.
    pub fn set_filter_params(&mut self, params: FilterParams) {
        self.config.filter = FilterParams {
            envelope_alpha: params.envelope_alpha.clamp(0.0, 1.0),
            ..params
        };
    }

    pub fn set_selected_channel(&mut self, channel: usize) {
        self.config.selected_channel = channel.min(self.config.channel_count - 1);
    }

    pub fn set_output_dir(&mut self, dir: impl Into<PathBuf>) {
        self.output_dir = dir.into();
    }

    /// Open a new trace in the output directory. Any recording already in
    /// progress is closed first.
    pub fn start_recording(&mut self) -> io::Result<PathBuf> {
        self.stop_recording()?;
        let header = TraceHeader::new(self.config.adc_bits, self.rate_hz, self.config.gains);
        let rec = Recorder::start(
            &self.output_dir,
            self.config.channel_count,
            self.config.signal_unit,
            header,
        )?;
        let path = rec.binary_path().to_path_buf();
        self.recorder = Some(rec);
        Ok(path)
    }

    pub fn stop_recording(&mut self) -> io::Result<Option<RecordingSummary>> {
        match self.recorder.take() {
            Some(rec) => rec.stop().map(Some),
            None => Ok(None),
        }
    }

    /// Attach a live byte source. Replaces whatever source was active.
    pub fn start_live(&mut self, mut source: Box<dyn ByteSource>) {
        source.send_command(channel_count_command(self.config.channel_count));
        for (ch, &g) in self.config.gains.iter().enumerate() {
            source.send_command(gain_command(ch, g));
        }
        info!(
            "Live acquisition started ({} channel(s), connected: {})",
            self.config.channel_count,
            source.is_connected()
        );
        self.source = Source::Live(source);
        self.decoder.reset();
        self.live_us = None;
        self.rate_hz = self.config.nominal_rate_hz;
        self.full_reset(0.0);
    }

    /// Detach the live source; dropping it closes the port.
    pub fn stop_live(&mut self) {
        if matches!(self.source, Source::Live(_)) {
            self.source = Source::Idle;
            self.decoder.reset();
            info!("Live acquisition stopped");
        }
    }

    /// Load a trace and replay it. On error nothing is changed.
    pub fn start_playback(&mut self, path: &Path) -> Result<(), FormatError> {
        let trace = Trace::load(path)?;
        let header = *trace.header();
        self.config.adc_bits = header.adc_bits;
        self.config.gains = header.gains;
        self.rate_hz = trace.rate_hz();
        self.source = Source::Replay(PlaybackSession::new(trace));
        self.decoder.reset();
        self.full_reset(0.0);
        Ok(())
    }

    /// Jump to `percent` of the trace. Returns the new sample index, or
    /// `None` when not replaying.
    pub fn seek(&mut self, percent: f64) -> Option<usize> {
        let (index, origin) = match &mut self.source {
            Source::Replay(session) => {
                let index = session.seek(percent);
                (index, session.trace().time_of(index))
            }
            _ => return None,
        };
        debug!("Seek to {:.1}% (sample {})", percent, index);
        self.restart_ring(origin);
        Some(index)
    }

    pub fn stop_playback(&mut self) {
        if matches!(self.source, Source::Replay(_)) {
            self.source = Source::Idle;
            self.rate_hz = self.config.nominal_rate_hz;
            self.full_reset(0.0);
            info!("Playback stopped");
        }
    }

    // ─── Read-only views ────────────────────────────────────────────────────

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        match self.source {
            Source::Idle => Mode::Idle,
            Source::Live(_) => Mode::Live,
            Source::Replay(_) => Mode::Replay,
        }
    }

    pub fn is_connected(&self) -> bool {
        match &self.source {
            Source::Live(src) => src.is_connected(),
            _ => false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_some()
    }

    pub fn recorded_samples(&self) -> u64 {
        self.recorder.as_ref().map_or(0, |r| r.samples())
    }

    pub fn rate_hz(&self) -> f64 {
        self.rate_hz
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.stats
    }

    pub fn decode_stats(&self) -> DecodeStats {
        self.decoder.stats()
    }

    pub fn ring(&self) -> &SampleRing {
        &self.ring
    }

    /// Ring time axis, oldest first.
    pub fn times(&self) -> RingView<'_> {
        self.ring.times()
    }

    pub fn filtered(&self, channel: usize) -> RingView<'_> {
        self.filters.filtered(channel)
    }

    pub fn envelope(&self, channel: usize) -> RingView<'_> {
        self.filters.envelope(channel)
    }

    pub fn latest_envelope(&self, channel: usize) -> f64 {
        self.filters.latest_envelope(channel)
    }

    pub fn spectrum(&self) -> &[f64] {
        self.spectrum.magnitudes(self.config.spectrum_fraction)
    }

    pub fn spectrum_frequencies(&self) -> Vec<f64> {
        self.spectrum.frequencies(self.config.spectrum_fraction)
    }

    pub fn spectrum_peak(&self) -> Option<f64> {
        if self.spectrum.updates() == 0 {
            return None;
        }
        self.spectrum.peak_frequency(self.config.spectrum_fraction)
    }

    /// Playback slider position in [0, 100), when replaying.
    pub fn playback_position(&self) -> Option<f64> {
        match &self.source {
            Source::Replay(session) => Some(session.position_percent()),
            _ => None,
        }
    }
}
