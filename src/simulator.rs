use crate::decoder::encode_burst;
use crate::transport::ByteSource;
use crate::types::*;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::time::Instant;

/// Most frames emitted by one read in real-time mode, so a stalled caller
/// does not get a multi-second burst on its next read.
const MAX_FRAMES_PER_READ: usize = 4000;

/// A synthetic sensor that speaks the wire protocol: each read returns one
/// burst of frames followed by the marker.
///
/// Every channel carries a steady tone on top of the ADC midpoint, mains hum,
/// a little noise, and intermittent broadband bursts that look like muscle
/// activity. The channel-count and gain control bytes are honoured.
pub struct SimulatedDevice {
    rng: StdRng,
    rate_hz: f64,
    channels: usize,
    adc: AdcBits,
    gains: [Gain; MAX_CHANNELS],
    /// Fixed frames per read for reproducible runs; `None` follows the clock.
    frames_per_read: Option<usize>,
    started: Instant,
    emitted: u64,
    activity: Activity,
    commands: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Activity {
    /// Samples left in the current burst, or until the next one.
    remaining: u64,
    active: bool,
    amplitude: f64,
}

impl SimulatedDevice {
    pub fn new(channels: usize, rate_hz: f64) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            rate_hz: rate_hz.max(1.0),
            channels: channels.clamp(1, MAX_CHANNELS),
            adc: AdcBits::default(),
            gains: [Gain::X1; MAX_CHANNELS],
            frames_per_read: None,
            started: Instant::now(),
            emitted: 0,
            activity: Activity::default(),
            commands: Vec::new(),
        }
    }

    /// Emit exactly `frames` per read from a seeded generator.
    pub fn deterministic(mut self, frames: usize, seed: u64) -> Self {
        self.frames_per_read = Some(frames);
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_adc(mut self, adc: AdcBits) -> Self {
        self.adc = adc;
        self
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn gains(&self) -> &[Gain; MAX_CHANNELS] {
        &self.gains
    }

    /// Control bytes received so far.
    pub fn commands(&self) -> &[u8] {
        &self.commands
    }

    fn frames_due(&self) -> usize {
        match self.frames_per_read {
            Some(n) => n,
            None => {
                let due = (self.started.elapsed().as_secs_f64() * self.rate_hz) as u64;
                (due.saturating_sub(self.emitted) as usize).min(MAX_FRAMES_PER_READ)
            }
        }
    }

    fn step_activity(&mut self) {
        if self.activity.remaining == 0 {
            let a = &mut self.activity;
            a.active = !a.active;
            let secs = if a.active {
                self.rng.gen_range(0.3..0.8)
            } else {
                self.rng.gen_range(0.8..2.0)
            };
            a.remaining = (secs * self.rate_hz) as u64;
            a.amplitude = self.rng.gen_range(60.0..160.0);
        }
        self.activity.remaining = self.activity.remaining.saturating_sub(1);
    }

    fn next_frame(&mut self) -> SampleFrame {
        let t = self.emitted as f64 / self.rate_hz;
        self.step_activity();
        let mid = self.adc.midpoint();
        let max = self.adc.max_count();
        let mut raw = [0u16; MAX_CHANNELS];
        for (ch, r) in raw.iter_mut().enumerate().take(self.channels) {
            let tone = 20.0 * (2.0 * PI * (80.0 + 20.0 * ch as f64) * t).sin();
            let hum = 15.0 * (2.0 * PI * 50.0 * t).sin();
            let noise = self.rng.gen_range(-3.0..3.0);
            let burst = if self.activity.active {
                self.activity.amplitude * self.rng.gen_range(-1.0..1.0)
            } else {
                0.0
            };
            let v = mid + (tone + hum + noise + burst) * self.gains[ch].multiplier();
            *r = v.round().clamp(0.0, max) as u16;
        }
        self.emitted += 1;
        SampleFrame {
            raw,
            channels: self.channels,
            dt_us: (1e6 / self.rate_hz).round() as u16,
        }
    }
}

impl ByteSource for SimulatedDevice {
    fn read_available(&mut self) -> Vec<u8> {
        let n = self.frames_due();
        if n == 0 {
            return Vec::new();
        }
        let frames: Vec<SampleFrame> = (0..n).map(|_| self.next_frame()).collect();
        let mut out = Vec::with_capacity(n * frame_size(self.channels) + 2);
        encode_burst(&frames, &mut out);
        out
    }

    fn send_command(&mut self, byte: u8) {
        self.commands.push(byte);
        match byte {
            1..=6 => {
                self.channels = byte as usize;
                info!("Simulator: streaming {} channel(s)", self.channels);
            }
            10..=69 => {
                let ch = (byte / 10 - 1) as usize;
                match Gain::from_index((byte % 10) as u16) {
                    Some(g) if ch < MAX_CHANNELS => {
                        self.gains[ch] = g;
                        debug!("Simulator: channel {} gain {}", ch, g);
                    }
                    _ => debug!("Simulator: ignoring control byte {}", byte),
                }
            }
            _ => debug!("Simulator: ignoring control byte {}", byte),
        }
    }

    fn is_connected(&self) -> bool {
        true
    }
}
