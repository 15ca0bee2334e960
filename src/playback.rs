use crate::error::FormatError;
use crate::recorder::{TraceHeader, HEADER_SIZE, RECORD_SIZE};
use crate::types::*;
use byteorder::{ByteOrder, LittleEndian};
use log::info;
use std::io::Cursor;
use std::path::Path;

/// A recorded trace held entirely in memory as raw records. Binary traces
/// are taken as they are; text traces are mapped back to raw counts.
#[derive(Debug, Clone)]
pub struct Trace {
    header: TraceHeader,
    body: Vec<u8>,
    count: usize,
}

impl Trace {
    /// Load a `.txt` text trace or, for any other extension, a binary one.
    pub fn load(path: &Path) -> Result<Self, FormatError> {
        let is_text = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("txt"));
        let trace = if is_text {
            Self::from_text(&std::fs::read_to_string(path)?)?
        } else {
            Self::from_bytes(std::fs::read(path)?)?
        };
        info!(
            "Loaded trace {:?}: {} samples at {} Hz, {}-bit ADC",
            path,
            trace.count,
            trace.header.sampling_freq_hz,
            trace.header.adc_bits.bits()
        );
        Ok(trace)
    }

    /// Validate and take ownership of a complete trace file image.
    pub fn from_bytes(mut bytes: Vec<u8>) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Truncated { len: bytes.len() });
        }
        let body_len = bytes.len() - HEADER_SIZE;
        if body_len == 0 {
            return Err(FormatError::Empty);
        }
        if body_len % RECORD_SIZE != 0 {
            return Err(FormatError::MisalignedBody { body_len });
        }
        let header = TraceHeader::read_from(&mut Cursor::new(&bytes[..HEADER_SIZE]))?;
        let body = bytes.split_off(HEADER_SIZE);
        Ok(Self {
            header,
            body,
            count: body_len / RECORD_SIZE,
        })
    }

    /// Parse a text trace: `Key: value` header lines followed by one
    /// `time v0 v1 v2 v3 v4 v5` line per sample. Values are mapped back to
    /// raw counts using the header's signal unit, ADC resolution and gains.
    /// The time column is checked but not kept; as with binary traces,
    /// sample `i` plays at `i / frequency`.
    pub fn from_text(text: &str) -> Result<Self, FormatError> {
        let lines: Vec<(usize, &str)> = text
            .lines()
            .enumerate()
            .map(|(n, l)| (n + 1, l.trim()))
            .filter(|(_, l)| !l.is_empty())
            .collect();
        let data_start = lines
            .iter()
            .position(|(_, l)| starts_with_number(l))
            .unwrap_or(lines.len());
        let (header, unit) = parse_text_header(&lines[..data_start])?;

        let mut records = Vec::with_capacity(lines.len() - data_start);
        for &(line, content) in &lines[data_start..] {
            let fields = parse_sample_line(content).ok_or_else(|| FormatError::BadLine {
                line,
                reason: format!("expected a time and {} values, got {:?}", MAX_CHANNELS, content),
            })?;
            let mut raw = [0u16; MAX_CHANNELS];
            for (ch, r) in raw.iter_mut().enumerate() {
                *r = unit.to_raw(fields[ch + 1], header.adc_bits, header.gains[ch]);
            }
            records.push(raw);
        }
        Self::from_records(header, &records)
    }

    fn from_records(
        header: TraceHeader,
        records: &[[u16; MAX_CHANNELS]],
    ) -> Result<Self, FormatError> {
        if records.is_empty() {
            return Err(FormatError::Empty);
        }
        let mut body = vec![0u8; records.len() * RECORD_SIZE];
        for (raw, out) in records.iter().zip(body.chunks_exact_mut(RECORD_SIZE)) {
            LittleEndian::write_u16_into(raw, out);
        }
        Ok(Self {
            header,
            body,
            count: records.len(),
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    /// Number of samples in the trace (always at least one).
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn rate_hz(&self) -> f64 {
        self.header.sampling_freq_hz as f64
    }

    /// Playback time of sample `index`.
    pub fn time_of(&self, index: usize) -> f64 {
        index as f64 / self.rate_hz()
    }

    /// Raw counts of sample `index`. Panics if out of range.
    pub fn record(&self, index: usize) -> [u16; MAX_CHANNELS] {
        let start = index * RECORD_SIZE;
        let mut raw = [0u16; MAX_CHANNELS];
        LittleEndian::read_u16_into(&self.body[start..start + RECORD_SIZE], &mut raw);
        raw
    }

    pub fn sample(&self, index: usize) -> Sample {
        Sample {
            time: self.time_of(index),
            raw: self.record(index),
        }
    }
}

fn starts_with_number(line: &str) -> bool {
    line.split_whitespace()
        .next()
        .is_some_and(|t| t.parse::<f64>().is_ok())
}

/// Time plus six values, all finite, and nothing else.
fn parse_sample_line(line: &str) -> Option<[f64; MAX_CHANNELS + 1]> {
    let mut out = [0.0; MAX_CHANNELS + 1];
    let mut fields = line.split_whitespace();
    for slot in out.iter_mut() {
        *slot = fields.next()?.parse().ok().filter(|v: &f64| v.is_finite())?;
    }
    fields.next().is_none().then_some(out)
}

/// Read the fields the recorder writes. Only the sampling frequency is
/// required; the rest default to raw 10-bit counts at unit gain.
fn parse_text_header(lines: &[(usize, &str)]) -> Result<(TraceHeader, SignalUnit), FormatError> {
    let bad = |msg: String| FormatError::BadHeader(msg);
    let mut rate = None;
    let mut adc_bits = AdcBits::default();
    let mut gains = [Gain::X1; MAX_CHANNELS];
    let mut unit = SignalUnit::Raw;

    for (_, line) in lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Sample frequency" => match value.parse::<u16>() {
                Ok(hz) if hz > 0 => rate = Some(hz),
                _ => return Err(bad(format!("sample frequency {:?}", value))),
            },
            "ADC bits" => {
                adc_bits = value
                    .parse::<u16>()
                    .ok()
                    .and_then(AdcBits::from_bits)
                    .ok_or_else(|| bad(format!("unsupported ADC resolution {:?}", value)))?;
            }
            "Gains" => {
                let parsed: Vec<Gain> = value
                    .split_whitespace()
                    .filter_map(|g| {
                        let m: f64 = g.strip_prefix('x')?.parse().ok()?;
                        Gain::ALL.iter().copied().find(|gain| gain.multiplier() == m)
                    })
                    .collect();
                if parsed.len() != MAX_CHANNELS {
                    return Err(bad(format!("gains {:?}", value)));
                }
                gains.copy_from_slice(&parsed);
            }
            "Signal unit" => {
                unit = SignalUnit::from_label(value)
                    .ok_or_else(|| bad(format!("signal unit {:?}", value)))?;
            }
            _ => {}
        }
    }

    let rate = rate.ok_or_else(|| bad("missing sample frequency".into()))?;
    Ok((
        TraceHeader {
            adc_bits,
            sampling_freq_hz: rate,
            gains,
        },
        unit,
    ))
}

/// Result of stepping a playback session by one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Sample(Sample),
    /// The previous sample was the last one; the session is back at index 0.
    Rewound,
}

/// A loaded trace plus a replay cursor.
pub struct PlaybackSession {
    trace: Trace,
    index: usize,
    loops: u64,
}

impl PlaybackSession {
    pub fn new(trace: Trace) -> Self {
        Self {
            trace,
            index: 0,
            loops: 0,
        }
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// Index of the next sample [`advance`](Self::advance) will return.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn loops(&self) -> u64 {
        self.loops
    }

    /// Slider position in [0, 100).
    pub fn position_percent(&self) -> f64 {
        self.index as f64 * 100.0 / self.trace.count as f64
    }

    /// Jump to `percent` of the trace. Returns the new index; the caller
    /// restarts its ring at `trace().time_of(index)`.
    pub fn seek(&mut self, percent: f64) -> usize {
        let p = if percent.is_finite() { percent.clamp(0.0, 100.0) } else { 0.0 };
        let index = (p / 100.0 * self.trace.count as f64).floor() as usize;
        self.index = index.min(self.trace.count - 1);
        self.index
    }

    pub fn advance(&mut self) -> Step {
        if self.index >= self.trace.count {
            self.index = 0;
            self.loops += 1;
            return Step::Rewound;
        }
        let sample = self.trace.sample(self.index);
        self.index += 1;
        Step::Sample(sample)
    }
}
