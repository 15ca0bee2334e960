use crate::config::FilterParams;
use crate::dsp::{butterworth_qs, BiquadCoeffs, Cascade, DcBlocker};
use crate::ring::{RingView, SampleRing};
use crate::types::*;
use log::debug;

/// Causal filter chain run once per tick over the newly written part of the
/// ring: mains notch cascade, Butterworth bandpass, then a rectifying
/// envelope detector.
///
/// # State
///
/// Outputs live in arrays aligned slot-for-slot with the ring, so the views
/// returned here line up with [`SampleRing::times`]. Per-channel delay lines
/// and envelope accumulators persist between ticks. They are thrown away
/// and the whole valid window is refiltered whenever
///   - the ring was reset or resized (its epoch changed),
///   - the filter design changed (cutoffs, notch, rate, channel count).
///
/// Changing only the envelope coefficient takes effect from the next sample.
pub struct FilterPipeline {
    key: Option<FilterKey>,
    design: FilterDesign,
    channels: Vec<ChannelState>,
    filtered: Vec<Vec<f64>>,
    envelope: Vec<Vec<f64>>,
    ring_epoch: Option<u64>,
    cursor: usize,
    /// Set after invalidation until enough samples exist to refilter.
    needs_full: bool,
    /// Outputs still to be forced to the settle level after a reset.
    settle_remaining: usize,
    settle_level: f64,
    recomputes: u64,
}

/// Samples required in the ring before any filtering happens.
pub const MIN_STABLE_WINDOW: usize = 64;

/// Seconds of output forced to the settle level after a state reset.
pub const SETTLING_SECONDS: f64 = 0.05;

/// Poles per bandpass edge.
pub const BANDPASS_ORDER: usize = 4;

/// -3 dB width of each mains notch.
pub const NOTCH_BANDWIDTH_HZ: f64 = 10.0;

/// Lowest usable cutoff.
pub const MIN_CUTOFF_HZ: f64 = 1.0;

/// Highest usable cutoff as a fraction of Nyquist.
pub const MAX_CUTOFF_FRACTION: f64 = 0.95;

/// Corner of the DC blocker ahead of the envelope rectifier.
pub const ENVELOPE_DC_CUTOFF_HZ: f64 = 1.0;

/// Everything the filter coefficients depend on.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FilterKey {
    bandpass: Option<(f64, f64)>,
    notch: Mains,
    rate_hz: f64,
    channels: usize,
}

impl FilterKey {
    fn new(params: &FilterParams, channels: usize, rate_hz: f64) -> Self {
        let bp = &params.bandpass;
        Self {
            bandpass: bp
                .enabled
                .then(|| clamp_cutoffs(bp.low_hz, bp.high_hz, rate_hz)),
            notch: params.notch,
            rate_hz,
            channels,
        }
    }
}

/// Coefficients derived from a [`FilterKey`]; rebuilt only when it changes.
#[derive(Debug, Clone, Default)]
struct FilterDesign {
    sections: Vec<BiquadCoeffs>,
}

impl FilterDesign {
    fn new(key: &FilterKey) -> Self {
        let mut sections: Vec<BiquadCoeffs> = notch_harmonics(key.notch, key.rate_hz)
            .into_iter()
            .map(|f| BiquadCoeffs::notch(f, NOTCH_BANDWIDTH_HZ, key.rate_hz))
            .collect();
        if let Some((low, high)) = key.bandpass {
            let qs = butterworth_qs(BANDPASS_ORDER);
            for &q in &qs {
                sections.push(BiquadCoeffs::highpass_q(low, q, key.rate_hz));
            }
            for &q in &qs {
                sections.push(BiquadCoeffs::lowpass_q(high, q, key.rate_hz));
            }
        }
        Self { sections }
    }
}

#[derive(Debug, Clone)]
struct ChannelState {
    chain: Cascade,
    dc: DcBlocker,
    /// Three cascaded exponential smoothers.
    ma: [f64; 3],
}

impl ChannelState {
    fn new(design: &FilterDesign, rate_hz: f64) -> Self {
        Self {
            chain: Cascade::new(&design.sections),
            dc: DcBlocker::new(ENVELOPE_DC_CUTOFF_HZ, rate_hz),
            ma: [0.0; 3],
        }
    }

    fn envelope(&mut self, y: f64, alpha: f64) -> f64 {
        let r = self.dc.process(y).abs();
        self.ma[0] = (1.0 - alpha) * r + alpha * self.ma[0];
        self.ma[1] = (1.0 - alpha) * self.ma[0] + alpha * self.ma[1];
        self.ma[2] = (1.0 - alpha) * self.ma[1] + alpha * self.ma[2];
        self.ma[2] * 2.0
    }
}

/// Clamp user cutoffs into the usable range for `rate_hz`, forcing
/// `low <= high`.
pub fn clamp_cutoffs(low: f64, high: f64, rate_hz: f64) -> (f64, f64) {
    let max = (rate_hz / 2.0 * MAX_CUTOFF_FRACTION).max(MIN_CUTOFF_HZ);
    let high = high.clamp(MIN_CUTOFF_HZ, max);
    let low = low.clamp(MIN_CUTOFF_HZ, max).min(high);
    (low, high)
}

/// Notch centres: the mains fundamental and every harmonic whose band fits
/// below Nyquist.
pub fn notch_harmonics(mains: Mains, rate_hz: f64) -> Vec<f64> {
    let Some(f0) = mains.fundamental() else {
        return Vec::new();
    };
    let nyquist = rate_hz / 2.0;
    (1..)
        .map(|k| k as f64 * f0)
        .take_while(|f| f + NOTCH_BANDWIDTH_HZ / 2.0 < nyquist)
        .collect()
}

impl FilterPipeline {
    pub fn new(capacity: usize, baseline: f64) -> Self {
        Self {
            key: None,
            design: FilterDesign::default(),
            channels: Vec::new(),
            filtered: vec![vec![baseline; capacity]; MAX_CHANNELS],
            envelope: vec![vec![0.0; capacity]; MAX_CHANNELS],
            ring_epoch: None,
            cursor: 0,
            needs_full: true,
            settle_remaining: 0,
            settle_level: baseline,
            recomputes: 0,
        }
    }

    /// Number of full-window refilters so far.
    pub fn recomputes(&self) -> u64 {
        self.recomputes
    }

    /// Force a full refilter on the next run.
    pub fn invalidate(&mut self) {
        self.ring_epoch = None;
    }

    /// Filter everything written to `ring` since the previous run.
    pub fn run(
        &mut self,
        ring: &mut SampleRing,
        params: &FilterParams,
        channels: usize,
        rate_hz: f64,
    ) {
        let new = ring.take_new_count();
        let key = FilterKey::new(params, channels, rate_hz);
        let alpha = params.envelope_alpha.clamp(0.0, 1.0);

        if self.key != Some(key) || self.ring_epoch != Some(ring.epoch()) {
            if self.key != Some(key) {
                self.design = FilterDesign::new(&key);
                debug!(
                    "Filters: {} sections for {:?} at {:.1} Hz",
                    self.design.sections.len(),
                    key.bandpass,
                    rate_hz
                );
            }
            self.key = Some(key);
            self.ring_epoch = Some(ring.epoch());
            self.settle_level = if key.bandpass.is_some() {
                0.0
            } else {
                ring.baseline()
            };
            self.clear(ring.capacity());
            self.needs_full = true;
        }
        self.cursor = ring.cursor();

        let filled = ring.filled();
        if filled < MIN_STABLE_WINDOW {
            return;
        }

        let count = if self.needs_full {
            self.restart(ring, channels, rate_hz);
            filled
        } else {
            new
        };
        if count == 0 {
            return;
        }

        let capacity = ring.capacity();
        let mut settle = self.settle_remaining;
        for ch in 0..channels {
            let input = ring.channel_slots(ch);
            let state = &mut self.channels[ch];
            settle = self.settle_remaining;
            for i in capacity - count..capacity {
                let slot = ring.slot_of(i);
                let mut y = state.chain.process(input[slot]);
                if settle > 0 {
                    y = self.settle_level;
                    settle -= 1;
                }
                self.filtered[ch][slot] = y;
                self.envelope[ch][slot] = state.envelope(y, alpha);
            }
        }
        self.settle_remaining = settle;
    }

    fn clear(&mut self, capacity: usize) {
        for (f, e) in self.filtered.iter_mut().zip(self.envelope.iter_mut()) {
            f.clear();
            f.resize(capacity, self.settle_level);
            e.clear();
            e.resize(capacity, 0.0);
        }
    }

    /// Fresh delay lines primed on the oldest valid sample.
    fn restart(&mut self, ring: &SampleRing, channels: usize, rate_hz: f64) {
        let first = ring.capacity() - ring.filled();
        self.channels = (0..channels)
            .map(|ch| {
                let mut state = ChannelState::new(&self.design, rate_hz);
                let x0 = ring.channel_slots(ch)[ring.slot_of(first)];
                state.chain.prime(x0);
                state.dc.prime(self.settle_level);
                state
            })
            .collect();
        self.settle_remaining = (SETTLING_SECONDS * rate_hz).round() as usize;
        self.needs_full = false;
        self.recomputes += 1;
    }

    /// Filtered signal of `ch` in chronological order.
    pub fn filtered(&self, ch: usize) -> RingView<'_> {
        RingView::over(&self.filtered[ch], self.cursor)
    }

    /// Envelope of `ch` in chronological order.
    pub fn envelope(&self, ch: usize) -> RingView<'_> {
        RingView::over(&self.envelope[ch], self.cursor)
    }

    /// Most recent envelope value of `ch`.
    pub fn latest_envelope(&self, ch: usize) -> f64 {
        self.envelope(ch).last().unwrap_or(0.0)
    }
}
