use serde::{Deserialize, Serialize};
use std::fmt;

// ─── Wire / device constants ────────────────────────────────────────────────

/// Maximum number of sensor channels the device can stream.
pub const MAX_CHANNELS: usize = 6;

/// Two-byte marker terminating a burst of frames on the serial link.
pub const BURST_MARKER: [u8; 2] = [0xFF, 0xFF];

/// Bytes per frame for a given active channel count:
/// 2 bytes per channel (u16 LE raw ADC) + 2 bytes delta-time (u16 LE µs).
pub fn frame_size(channels: usize) -> usize {
    2 * channels + 2
}

// ─── Gain ───────────────────────────────────────────────────────────────────

/// Per-channel amplifier gain. The discriminant is the index sent to the
/// device and stored in the trace header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Gain {
    #[default]
    X1,
    X2,
    X4,
    X5,
    X8,
    X10,
    X16,
    X32,
}

impl Gain {
    pub const ALL: [Gain; 8] = [
        Gain::X1,
        Gain::X2,
        Gain::X4,
        Gain::X5,
        Gain::X8,
        Gain::X10,
        Gain::X16,
        Gain::X32,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u16) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn multiplier(self) -> f64 {
        match self {
            Gain::X1 => 1.0,
            Gain::X2 => 2.0,
            Gain::X4 => 4.0,
            Gain::X5 => 5.0,
            Gain::X8 => 8.0,
            Gain::X10 => 10.0,
            Gain::X16 => 16.0,
            Gain::X32 => 32.0,
        }
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x{}", self.multiplier())
    }
}

// ─── ADC resolution ─────────────────────────────────────────────────────────

/// ADC resolution shared by all channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdcBits {
    B8,
    #[default]
    B10,
    B12,
    B14,
    B16,
}

impl AdcBits {
    pub fn bits(self) -> u16 {
        match self {
            AdcBits::B8 => 8,
            AdcBits::B10 => 10,
            AdcBits::B12 => 12,
            AdcBits::B14 => 14,
            AdcBits::B16 => 16,
        }
    }

    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(AdcBits::B8),
            10 => Some(AdcBits::B10),
            12 => Some(AdcBits::B12),
            14 => Some(AdcBits::B14),
            16 => Some(AdcBits::B16),
            _ => None,
        }
    }

    /// Largest raw count the ADC can produce.
    pub fn max_count(self) -> f64 {
        ((1u32 << self.bits()) - 1) as f64
    }

    /// Raw count of a zero-volt input.
    pub fn midpoint(self) -> f64 {
        self.max_count() / 2.0
    }
}

// ─── Signal unit ────────────────────────────────────────────────────────────

/// How raw counts are presented to the ring and the text trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignalUnit {
    /// Raw ADC counts, centred on the ADC midpoint.
    #[default]
    Raw,
    /// Input-referred millivolts for a 5 V reference, centred on zero.
    Millivolts,
}

impl SignalUnit {
    pub fn convert(self, raw: u16, adc: AdcBits, gain: Gain) -> f64 {
        match self {
            SignalUnit::Raw => raw as f64,
            SignalUnit::Millivolts => {
                let max = adc.max_count();
                (raw as f64 - max / 2.0) * 5000.0 / max / gain.multiplier()
            }
        }
    }

    /// Raw count that [`convert`](Self::convert) maps closest to `value`.
    pub fn to_raw(self, value: f64, adc: AdcBits, gain: Gain) -> u16 {
        let max = adc.max_count();
        let raw = match self {
            SignalUnit::Raw => value,
            SignalUnit::Millivolts => value * gain.multiplier() * max / 5000.0 + max / 2.0,
        };
        raw.round().clamp(0.0, max) as u16
    }

    /// Name written to the text trace header.
    pub fn label(self) -> &'static str {
        match self {
            SignalUnit::Raw => "raw",
            SignalUnit::Millivolts => "mV",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "raw" => Some(SignalUnit::Raw),
            "mV" => Some(SignalUnit::Millivolts),
            _ => None,
        }
    }

    /// Value of a zero-signal input in this unit.
    pub fn baseline(self, adc: AdcBits) -> f64 {
        match self {
            SignalUnit::Raw => adc.midpoint(),
            SignalUnit::Millivolts => 0.0,
        }
    }
}

// ─── Mains notch ────────────────────────────────────────────────────────────

/// Mains frequency rejected by the notch stage (with its harmonics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mains {
    #[default]
    Off,
    Hz50,
    Hz60,
}

impl Mains {
    pub fn fundamental(self) -> Option<f64> {
        match self {
            Mains::Off => None,
            Mains::Hz50 => Some(50.0),
            Mains::Hz60 => Some(60.0),
        }
    }
}

// ─── Samples ────────────────────────────────────────────────────────────────

/// One synchronized reading across the active channels, as decoded from the
/// wire. Channels beyond `channels` are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFrame {
    pub raw: [u16; MAX_CHANNELS],
    pub channels: usize,
    /// Microseconds since the previous frame.
    pub dt_us: u16,
}

impl SampleFrame {
    pub fn active(&self) -> &[u16] {
        &self.raw[..self.channels]
    }
}

impl fmt::Display for SampleFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dt={:>5}µs  raw{:?}", self.dt_us, self.active())
    }
}

/// A sample ready for the ring: absolute time plus raw counts. Live input
/// and replay both produce these, so everything downstream is shared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Seconds since the start of the session (live) or trace (replay).
    pub time: f64,
    pub raw: [u16; MAX_CHANNELS],
}

// ─── Device control bytes ───────────────────────────────────────────────────

/// Control byte selecting the number of channels the device streams.
pub fn channel_count_command(count: usize) -> u8 {
    count.clamp(1, MAX_CHANNELS) as u8
}

/// Control byte setting one channel's gain.
pub fn gain_command(channel: usize, gain: Gain) -> u8 {
    ((channel as u8 + 1) * 10) + gain.index()
}
