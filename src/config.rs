//! Pipeline configuration: everything a tick needs to know that used to live
//! in UI widgets. Passed explicitly to the coordinator and serializable to a
//! JSON file so headless runs can be reproduced.

use crate::types::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::Duration;

/// Bandpass stage settings. Cutoffs are in Hz.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandpassConfig {
    pub enabled: bool,
    pub low_hz: f64,
    pub high_hz: f64,
}

impl Default for BandpassConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_hz: 10.0,
            high_hz: 200.0,
        }
    }
}

/// Filter settings that can change live between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterParams {
    pub bandpass: BandpassConfig,
    pub notch: Mains,
    /// Envelope smoothing coefficient in [0, 1]. Higher = smoother.
    pub envelope_alpha: f64,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            bandpass: BandpassConfig::default(),
            notch: Mains::Off,
            envelope_alpha: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Active channels, 1..=6.
    pub channel_count: usize,
    pub adc_bits: AdcBits,
    pub gains: [Gain; MAX_CHANNELS],
    pub signal_unit: SignalUnit,
    pub filter: FilterParams,
    /// Spectrum smoothing: smoothed = (1-β)·new + β·smoothed.
    pub spectrum_beta: f64,
    /// Fraction of spectrum bins exposed for display, at most 0.5.
    pub spectrum_fraction: f64,
    /// Channel shown in the spectrum.
    pub selected_channel: usize,
    /// Seconds of history held by the ring.
    pub window_seconds: f64,
    /// Expected sampling rate before the estimator has measured one.
    pub nominal_rate_hz: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_count: 1,
            adc_bits: AdcBits::B10,
            gains: [Gain::X1; MAX_CHANNELS],
            signal_unit: SignalUnit::Raw,
            filter: FilterParams::default(),
            spectrum_beta: 0.85,
            spectrum_fraction: 1.0 / 3.0,
            selected_channel: 0,
            window_seconds: 12.0,
            nominal_rate_hz: 2000.0,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file. Returns None if the file is absent or malformed.
    pub fn load(path: &Path) -> Option<Self> {
        let data = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<PipelineConfig>(&data) {
            Ok(c) => {
                info!("Loaded pipeline config from {:?}", path);
                Some(c.sanitized())
            }
            Err(e) => {
                warn!("Failed to parse config file {:?}: {}", path, e);
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        std::fs::write(path, json)?;
        info!("Pipeline config saved to {:?}", path);
        Ok(())
    }

    /// Clamp every field into its valid range.
    pub fn sanitized(mut self) -> Self {
        self.channel_count = self.channel_count.clamp(1, MAX_CHANNELS);
        self.selected_channel = self.selected_channel.min(self.channel_count - 1);
        self.filter.envelope_alpha = self.filter.envelope_alpha.clamp(0.0, 1.0);
        self.spectrum_beta = self.spectrum_beta.clamp(0.0, 1.0);
        self.spectrum_fraction = self.spectrum_fraction.clamp(0.01, 0.5);
        if !(self.window_seconds > 0.0) {
            self.window_seconds = 12.0;
        }
        if !(self.nominal_rate_hz > 0.0) {
            self.nominal_rate_hz = 2000.0;
        }
        self
    }

    /// Delay between ticks; the device sends larger bursts with more channels.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(70 + 10 * self.channel_count as u64)
    }

    /// Ring value of a zero-signal input.
    pub fn baseline(&self) -> f64 {
        self.signal_unit.baseline(self.adc_bits)
    }

    /// Convert one raw count on `channel` into the configured unit.
    pub fn convert(&self, channel: usize, raw: u16) -> f64 {
        self.signal_unit
            .convert(raw, self.adc_bits, self.gains[channel])
    }
}
