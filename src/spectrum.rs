use crate::ring::RingView;
use log::trace;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Samples per spectral estimate.
pub const SPECTRUM_LEN: usize = 2000;

/// Bins skipped at the bottom when looking for the peak (DC and drift).
const PEAK_SKIP_BINS: usize = 2;

/// Exponentially smoothed magnitude spectrum of the most recent window of
/// one channel's filtered signal.
pub struct SpectralEstimator {
    len: usize,
    fft: Arc<dyn Fft<f64>>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
    smoothed: Vec<f64>,
    channel: Option<usize>,
    rate_hz: f64,
    updates: u64,
}

impl SpectralEstimator {
    pub fn new(len: usize) -> Self {
        let len = len.max(2);
        let fft = FftPlanner::new().plan_fft_forward(len);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];
        Self {
            len,
            fft,
            buffer: vec![Complex::default(); len],
            scratch,
            smoothed: vec![0.0; len],
            channel: None,
            rate_hz: 0.0,
            updates: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Drop the smoothing history.
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|v| *v = 0.0);
        self.updates = 0;
    }

    /// Fold the latest `len` samples of `signal` into the estimate.
    /// Switching channel or rate restarts the smoothing.
    pub fn update(&mut self, signal: RingView<'_>, channel: usize, beta: f64, rate_hz: f64) {
        if self.channel != Some(channel) || self.rate_hz != rate_hz {
            self.reset();
            self.channel = Some(channel);
            self.rate_hz = rate_hz;
        }

        // Zero-pad at the front if the signal is shorter than the window.
        let available = signal.len().min(self.len);
        let pad = self.len - available;
        let skip = signal.len() - available;
        self.buffer[..pad].iter_mut().for_each(|c| *c = Complex::default());
        for (dst, v) in self.buffer[pad..].iter_mut().zip(signal.iter().skip(skip)) {
            *dst = Complex::new(v, 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let beta = beta.clamp(0.0, 1.0);
        let n = self.len as f64;
        for (s, c) in self.smoothed.iter_mut().zip(self.buffer.iter()) {
            *s = (1.0 - beta) * (c.norm() / n) + beta * *s;
        }
        self.updates += 1;
        trace!("Spectrum: update {} for channel {}", self.updates, channel);
    }

    fn visible_bins(&self, fraction: f64) -> usize {
        ((self.len as f64 * fraction.clamp(0.0, 0.5)) as usize).max(1)
    }

    /// Smoothed magnitudes over the lowest `fraction` (≤ 0.5) of the bins.
    pub fn magnitudes(&self, fraction: f64) -> &[f64] {
        &self.smoothed[..self.visible_bins(fraction)]
    }

    /// Bin centre frequencies matching [`magnitudes`](Self::magnitudes).
    pub fn frequencies(&self, fraction: f64) -> Vec<f64> {
        let step = self.rate_hz / self.len as f64;
        (0..self.visible_bins(fraction))
            .map(|k| k as f64 * step)
            .collect()
    }

    /// Frequency of the strongest visible bin, ignoring the lowest bins.
    pub fn peak_frequency(&self, fraction: f64) -> Option<f64> {
        let bins = self.magnitudes(fraction);
        let (k, _) = bins
            .iter()
            .enumerate()
            .skip(PEAK_SKIP_BINS)
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        Some(k as f64 * self.rate_hz / self.len as f64)
    }
}
