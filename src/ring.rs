//! Fixed-capacity circular store of recent samples.
//!
//! All wraparound arithmetic lives here. Callers see the contents in
//! chronological order through [`RingView`], which borrows the two halves of
//! the buffer (`[cursor..capacity)` then `[0..cursor)`) without copying.

use crate::types::*;
use log::debug;

/// Chronological view over one ring array: `head` is older than `tail`.
#[derive(Debug, Clone, Copy)]
pub struct RingView<'a> {
    head: &'a [f64],
    tail: &'a [f64],
}

impl<'a> RingView<'a> {
    /// View a ring-aligned array whose oldest slot is `cursor`.
    pub fn over(slots: &'a [f64], cursor: usize) -> Self {
        let (tail, head) = slots.split_at(cursor);
        RingView { head, tail }
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` in chronological order (0 = oldest).
    pub fn get(&self, i: usize) -> Option<f64> {
        if i < self.head.len() {
            Some(self.head[i])
        } else {
            self.tail.get(i - self.head.len()).copied()
        }
    }

    pub fn last(&self) -> Option<f64> {
        self.tail.last().or_else(|| self.head.last()).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + 'a {
        self.head.iter().chain(self.tail.iter()).copied()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        let mut v = Vec::with_capacity(self.len());
        v.extend_from_slice(self.head);
        v.extend_from_slice(self.tail);
        v
    }
}

pub struct SampleRing {
    capacity: usize,
    time: Vec<f64>,
    data: Vec<Vec<f64>>,
    /// Next slot to write; also the oldest slot once the ring is full.
    cursor: usize,
    /// Writes since the last reset.
    written: u64,
    /// Writes since the filters last consumed new samples.
    pending: usize,
    last_time: f64,
    baseline: f64,
    /// Bumped on every reset so dependent state can tell it is stale.
    epoch: u64,
}

/// The ring never shrinks below this many slots.
pub const MIN_CAPACITY: usize = 16;

impl SampleRing {
    pub fn new(capacity: usize, baseline: f64) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        Self {
            capacity,
            time: vec![0.0; capacity],
            data: vec![vec![baseline; capacity]; MAX_CHANNELS],
            cursor: 0,
            written: 0,
            pending: 0,
            last_time: 0.0,
            baseline,
            epoch: 0,
        }
    }

    /// Capacity holding `window_seconds` of history at `rate_hz`.
    pub fn capacity_for(rate_hz: f64, window_seconds: f64) -> usize {
        ((rate_hz * window_seconds).round() as usize).max(MIN_CAPACITY)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Slots holding real samples (the rest still hold the baseline).
    pub fn filled(&self) -> usize {
        (self.written.min(self.capacity as u64)) as usize
    }

    /// Time of the most recent write, or the origin after a reset.
    pub fn last_time(&self) -> f64 {
        self.last_time
    }

    /// Claim the slot under the cursor and move the cursor on by one.
    fn advance(&mut self) -> usize {
        let slot = self.cursor;
        self.cursor = (self.cursor + 1) % self.capacity;
        self.written += 1;
        self.pending += 1;
        slot
    }

    /// Store one sample, overwriting the oldest slot.
    pub fn write(&mut self, time: f64, values: &[f64; MAX_CHANNELS]) {
        let slot = self.advance();
        self.time[slot] = time;
        for (ch, &v) in values.iter().enumerate() {
            self.data[ch][slot] = v;
        }
        self.last_time = time;
    }

    /// Number of samples written since the previous call, capped at the
    /// capacity (older ones have already been overwritten).
    pub fn take_new_count(&mut self) -> usize {
        let n = self.pending.min(self.capacity);
        self.pending = 0;
        n
    }

    pub fn new_count(&self) -> usize {
        self.pending.min(self.capacity)
    }

    /// Reinitialise every slot to `baseline` and place the time origin at
    /// `origin`. Capacity is unchanged.
    pub fn reset(&mut self, baseline: f64, origin: f64) {
        self.baseline = baseline;
        self.time.iter_mut().for_each(|t| *t = origin);
        for ch in self.data.iter_mut() {
            ch.iter_mut().for_each(|v| *v = baseline);
        }
        self.cursor = 0;
        self.written = 0;
        self.pending = 0;
        self.last_time = origin;
        self.epoch += 1;
    }

    /// Reallocate for a new capacity and reset.
    pub fn resize(&mut self, capacity: usize, baseline: f64, origin: f64) {
        let capacity = capacity.max(MIN_CAPACITY);
        if capacity != self.capacity {
            debug!("Ring: capacity {} → {}", self.capacity, capacity);
            self.capacity = capacity;
            self.time = vec![origin; capacity];
            self.data = vec![vec![baseline; capacity]; MAX_CHANNELS];
        }
        self.reset(baseline, origin);
    }

    /// Ring slot of chronological index `i` (0 = oldest).
    pub fn slot_of(&self, i: usize) -> usize {
        (self.cursor + i) % self.capacity
    }

    pub fn times(&self) -> RingView<'_> {
        RingView::over(&self.time, self.cursor)
    }

    pub fn channel(&self, ch: usize) -> RingView<'_> {
        RingView::over(&self.data[ch], self.cursor)
    }

    /// Raw slot access for ring-aligned derived arrays.
    pub fn channel_slots(&self, ch: usize) -> &[f64] {
        &self.data[ch]
    }
}

// ─── Sampling-rate estimation ───────────────────────────────────────────────

/// Measured rates at or below this are treated as start-up noise.
pub const MIN_TRUSTED_RATE_HZ: f64 = 400.0;

/// Relative deviation from the nominal rate that triggers a ring resize.
pub const RATE_DRIFT_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    /// Not enough data or rate too low to trust.
    Unknown,
    /// Within tolerance of nominal; carries the measured rate.
    Stable(f64),
    /// Outside tolerance; the ring must be resized for this rate.
    Drift(f64),
}

/// Running estimate of the sampling rate from accumulated frame deltas.
#[derive(Debug, Clone, Default)]
pub struct RateEstimator {
    samples: u64,
    elapsed_s: f64,
}

impl RateEstimator {
    pub fn observe(&mut self, dt_s: f64) {
        self.samples += 1;
        self.elapsed_s += dt_s;
    }

    pub fn reset(&mut self) {
        self.samples = 0;
        self.elapsed_s = 0.0;
    }

    pub fn measured(&self) -> Option<f64> {
        if self.samples == 0 || self.elapsed_s <= 0.0 {
            None
        } else {
            Some(self.samples as f64 / self.elapsed_s)
        }
    }

    pub fn assess(&self, nominal_hz: f64) -> RateDecision {
        match self.measured() {
            Some(rate) if rate > MIN_TRUSTED_RATE_HZ => {
                if (rate - nominal_hz).abs() / nominal_hz > RATE_DRIFT_TOLERANCE {
                    RateDecision::Drift(rate)
                } else {
                    RateDecision::Stable(rate)
                }
            }
            _ => RateDecision::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(v: f64) -> [f64; MAX_CHANNELS] {
        let mut out = [0.0; MAX_CHANNELS];
        for (i, o) in out.iter_mut().enumerate() {
            *o = v + i as f64 * 1000.0;
        }
        out
    }

    #[test]
    fn test_reset_fills_baseline() {
        let mut ring = SampleRing::new(32, 511.5);
        ring.write(0.1, &values(3.0));
        ring.reset(511.5, 2.0);
        assert_eq!(ring.cursor(), 0);
        assert_eq!(ring.filled(), 0);
        assert!(ring.channel(0).iter().all(|v| v == 511.5));
        assert!(ring.times().iter().all(|t| t == 2.0));
        assert_eq!(ring.last_time(), 2.0);
    }

    #[test]
    fn test_chronological_order_after_wrap() {
        let mut ring = SampleRing::new(20, 0.0);
        for i in 0..27 {
            ring.write(i as f64, &values(i as f64));
        }
        let times = ring.times().to_vec();
        assert_eq!(times.len(), 20);
        let expected: Vec<f64> = (7..27).map(|i| i as f64).collect();
        assert_eq!(times, expected);
        assert_eq!(ring.channel(1).get(0), Some(1007.0));
        assert_eq!(ring.channel(1).last(), Some(1026.0));
    }

    #[test]
    fn test_capacity_writes_overwrite_every_slot_once() {
        let cap = 50;
        let mut ring = SampleRing::new(cap, -1.0);
        ring.write(0.0, &values(0.0));
        for i in 1..=cap {
            ring.write(i as f64, &values(i as f64));
        }
        let seen = ring.channel(0).to_vec();
        let mut sorted = seen.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), cap, "no duplicates");
        let expected: Vec<f64> = (1..=cap).map(|i| i as f64).collect();
        assert_eq!(seen, expected, "last `capacity` writes, in order");
    }

    #[test]
    fn test_new_count_is_capped() {
        let mut ring = SampleRing::new(16, 0.0);
        for i in 0..5 {
            ring.write(i as f64, &values(0.0));
        }
        assert_eq!(ring.take_new_count(), 5);
        assert_eq!(ring.take_new_count(), 0);
        for i in 0..40 {
            ring.write(i as f64, &values(0.0));
        }
        assert_eq!(ring.take_new_count(), 16);
    }

    #[test]
    fn test_resize_bumps_epoch() {
        let mut ring = SampleRing::new(100, 0.0);
        let e = ring.epoch();
        ring.resize(200, 5.0, 0.0);
        assert_eq!(ring.capacity(), 200);
        assert_eq!(ring.epoch(), e + 1);
        assert!(ring.channel(3).iter().all(|v| v == 5.0));
    }

    #[test]
    fn test_capacity_for_window() {
        assert_eq!(SampleRing::capacity_for(2000.0, 12.0), 24000);
        assert_eq!(SampleRing::capacity_for(0.0, 12.0), MIN_CAPACITY);
    }

    #[test]
    fn test_rate_estimator_decisions() {
        let mut est = RateEstimator::default();
        assert_eq!(est.assess(2000.0), RateDecision::Unknown);
        for _ in 0..1000 {
            est.observe(0.0005);
        }
        match est.assess(2000.0) {
            RateDecision::Stable(r) => assert!((r - 2000.0).abs() < 1.0),
            other => panic!("expected stable, got {:?}", other),
        }
        match est.assess(1000.0) {
            RateDecision::Drift(r) => assert!((r - 2000.0).abs() < 1.0),
            other => panic!("expected drift, got {:?}", other),
        }
    }

    #[test]
    fn test_rate_estimator_ignores_slow_rates() {
        let mut est = RateEstimator::default();
        for _ in 0..100 {
            est.observe(0.01); // 100 Hz
        }
        assert_eq!(est.assess(2000.0), RateDecision::Unknown);
    }
}
