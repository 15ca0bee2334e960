//! Shared DSP primitives: biquad sections, Butterworth/notch designs, a DC
//! blocker, and test signal generators.

use std::f64::consts::{FRAC_1_SQRT_2, PI};

/// Normalised biquad coefficients (a0 = 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiquadCoeffs {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoeffs {
    fn normalise(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        Self {
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
        }
    }

    /// Second-order Butterworth low-pass.
    pub fn lowpass(fc: f64, fs: f64) -> Self {
        Self::lowpass_q(fc, FRAC_1_SQRT_2, fs)
    }

    /// Second-order Butterworth high-pass.
    pub fn highpass(fc: f64, fs: f64) -> Self {
        Self::highpass_q(fc, FRAC_1_SQRT_2, fs)
    }

    /// Second-order low-pass section with quality factor `q`.
    pub fn lowpass_q(fc: f64, q: f64, fs: f64) -> Self {
        let w = 2.0 * PI * fc / fs;
        let (sin, cos) = w.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalise(
            (1.0 - cos) / 2.0,
            1.0 - cos,
            (1.0 - cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    /// Second-order high-pass section with quality factor `q`.
    pub fn highpass_q(fc: f64, q: f64, fs: f64) -> Self {
        let w = 2.0 * PI * fc / fs;
        let (sin, cos) = w.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalise(
            (1.0 + cos) / 2.0,
            -(1.0 + cos),
            (1.0 + cos) / 2.0,
            1.0 + alpha,
            -2.0 * cos,
            1.0 - alpha,
        )
    }

    /// Band-reject centred on `f0` with -3 dB width `bandwidth` (Hz).
    pub fn notch(f0: f64, bandwidth: f64, fs: f64) -> Self {
        let w = 2.0 * PI * f0 / fs;
        let (sin, cos) = w.sin_cos();
        let q = f0 / bandwidth;
        let alpha = sin / (2.0 * q);
        Self::normalise(1.0, -2.0 * cos, 1.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
    }

    /// Gain for a constant input.
    pub fn dc_gain(&self) -> f64 {
        (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2)
    }

    /// Magnitude response at `freq`.
    pub fn gain_at(&self, freq: f64, fs: f64) -> f64 {
        let w = 2.0 * PI * freq / fs;
        let (s1, c1) = w.sin_cos();
        let (s2, c2) = (2.0 * w).sin_cos();
        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);
        ((num_re * num_re + num_im * num_im) / (den_re * den_re + den_im * den_im)).sqrt()
    }
}

/// Q of each second-order section of an even-order Butterworth filter.
pub fn butterworth_qs(order: usize) -> Vec<f64> {
    (0..order / 2)
        .map(|k| {
            let theta = PI * (2 * k + 1) as f64 / (2 * order) as f64;
            1.0 / (2.0 * theta.cos())
        })
        .collect()
}

/// One biquad section, direct form I.
#[derive(Debug, Clone, Copy)]
pub struct Biquad {
    c: BiquadCoeffs,
    x: [f64; 2],
    y: [f64; 2],
}

impl Biquad {
    pub fn new(c: BiquadCoeffs) -> Self {
        Self {
            c,
            x: [0.0; 2],
            y: [0.0; 2],
        }
    }

    /// Load the delay line as if `x0` had been the input forever, so a
    /// non-zero starting level does not produce a step response.
    pub fn prime(&mut self, x0: f64) {
        let y0 = x0 * self.c.dc_gain();
        self.x = [x0; 2];
        self.y = [y0; 2];
    }

    pub fn process(&mut self, input: f64) -> f64 {
        let c = &self.c;
        let output = c.b0 * input + c.b1 * self.x[0] + c.b2 * self.x[1]
            - c.a1 * self.y[0]
            - c.a2 * self.y[1];
        self.x[1] = self.x[0];
        self.x[0] = input;
        self.y[1] = self.y[0];
        self.y[0] = output;
        output
    }
}

/// A chain of biquads applied in order.
#[derive(Debug, Clone, Default)]
pub struct Cascade {
    sections: Vec<Biquad>,
}

impl Cascade {
    pub fn new(coeffs: &[BiquadCoeffs]) -> Self {
        Self {
            sections: coeffs.iter().copied().map(Biquad::new).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn prime(&mut self, x0: f64) {
        let mut level = x0;
        for s in self.sections.iter_mut() {
            s.prime(level);
            level *= s.c.dc_gain();
        }
    }

    pub fn process(&mut self, input: f64) -> f64 {
        self.sections
            .iter_mut()
            .fold(input, |acc, s| s.process(acc))
    }
}

/// First-order bilinear high-pass, used to strip DC before rectification.
#[derive(Debug, Clone, Copy)]
pub struct DcBlocker {
    two_fs: f64,
    wa: f64,
    x0: f64,
    y0: f64,
}

impl DcBlocker {
    pub fn new(cutoff_hz: f64, fs: f64) -> Self {
        Self {
            two_fs: 2.0 * fs,
            wa: 2.0 * fs * (PI * cutoff_hz / fs).tan(),
            x0: 0.0,
            y0: 0.0,
        }
    }

    pub fn prime(&mut self, x0: f64) {
        self.x0 = x0;
        self.y0 = 0.0;
    }

    pub fn process(&mut self, input: f64) -> f64 {
        let y = (self.two_fs * (input - self.x0) - (self.wa - self.two_fs) * self.y0)
            / (self.two_fs + self.wa);
        self.x0 = input;
        self.y0 = y;
        y
    }
}
