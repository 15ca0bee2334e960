use crate::error::FormatError;
use crate::types::*;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::Local;
use log::info;
use std::fs::{self, File};
use std::fmt::Write as _;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Binary trace layout (little-endian u16 throughout):
///
/// | Offset | Size | Field                         |
/// |--------|------|-------------------------------|
/// | 0      | 2    | ADC bits                      |
/// | 2      | 2    | sampling frequency (Hz)       |
/// | 4      | 2×6  | gain index, channels 0..5     |
/// | 16     | 2×6  | raw ADC, channels 0..5 (repeated per sample) |
///
/// There is no per-record timestamp; sample `i` is at `i / frequency`.
pub const HEADER_SIZE: usize = 16;
pub const RECORD_SIZE: usize = 2 * MAX_CHANNELS;

/// Fixed header written once at the start of every binary trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    pub adc_bits: AdcBits,
    pub sampling_freq_hz: u16,
    pub gains: [Gain; MAX_CHANNELS],
}

impl TraceHeader {
    pub fn new(adc_bits: AdcBits, sampling_freq_hz: f64, gains: [Gain; MAX_CHANNELS]) -> Self {
        Self {
            adc_bits,
            sampling_freq_hz: sampling_freq_hz.round().clamp(1.0, u16::MAX as f64) as u16,
            gains,
        }
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<LittleEndian>(self.adc_bits.bits())?;
        w.write_u16::<LittleEndian>(self.sampling_freq_hz)?;
        for g in &self.gains {
            w.write_u16::<LittleEndian>(g.index() as u16)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, FormatError> {
        let bits = r.read_u16::<LittleEndian>()?;
        let adc_bits = AdcBits::from_bits(bits)
            .ok_or_else(|| FormatError::BadHeader(format!("unsupported ADC resolution {}", bits)))?;
        let sampling_freq_hz = r.read_u16::<LittleEndian>()?;
        if sampling_freq_hz == 0 {
            return Err(FormatError::BadHeader("sampling frequency is zero".into()));
        }
        let mut gains = [Gain::X1; MAX_CHANNELS];
        for (ch, g) in gains.iter_mut().enumerate() {
            let idx = r.read_u16::<LittleEndian>()?;
            *g = Gain::from_index(idx).ok_or_else(|| {
                FormatError::BadHeader(format!("gain index {} on channel {}", idx, ch))
            })?;
        }
        Ok(Self {
            adc_bits,
            sampling_freq_hz,
            gains,
        })
    }
}

/// Where a finished recording ended up.
#[derive(Debug, Clone)]
pub struct RecordingSummary {
    pub binary_path: PathBuf,
    pub text_path: PathBuf,
    pub samples: u64,
}

/// One recording session: a binary trace plus a human-readable twin.
/// Both files are owned for the lifetime of the value and closed by
/// [`stop`](Recorder::stop) or on drop.
///
/// Each record and each text line goes out in a single write, so whatever
/// the buffers have flushed is always the header plus whole samples. A
/// process killed mid-session leaves files that still load.
pub struct Recorder {
    bin: BufWriter<File>,
    text: BufWriter<File>,
    binary_path: PathBuf,
    text_path: PathBuf,
    header: TraceHeader,
    samples: u64,
}

impl Recorder {
    /// Create `<timestamp>.bin` and `<timestamp>.txt` in `dir` and write
    /// both headers. `unit` is how the text trace presents values.
    pub fn start(
        dir: &Path,
        channels: usize,
        unit: SignalUnit,
        header: TraceHeader,
    ) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let now = Local::now();
        let stem = unique_stem(dir, &now.format("%Y_%m_%d_%H_%M_%S").to_string());
        let binary_path = dir.join(format!("{}.bin", stem));
        let text_path = dir.join(format!("{}.txt", stem));

        let mut bin = BufWriter::new(File::create(&binary_path)?);
        header.write_to(&mut bin)?;

        let mut text = BufWriter::new(File::create(&text_path)?);
        writeln!(text, "Date: {}", now.format("%Y.%m.%d"))?;
        writeln!(text, "Time: {}", now.format("%H:%M:%S"))?;
        writeln!(text, "Sample frequency: {}", header.sampling_freq_hz)?;
        writeln!(text, "ADC bits: {}", header.adc_bits.bits())?;
        writeln!(text, "Active channels: {}", channels)?;
        let gains: Vec<String> = header.gains.iter().map(|g| g.to_string()).collect();
        writeln!(text, "Gains: {}", gains.join(" "))?;
        writeln!(text, "Signal unit: {}", unit.label())?;
        writeln!(text, "File format:")?;
        writeln!(text, "time in s | 6 sensor data points")?;

        info!("Recording → {:?} (+ .txt)", binary_path);
        Ok(Self {
            bin,
            text,
            binary_path,
            text_path,
            header,
            samples: 0,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }

    /// Append one sample: raw counts to the binary trace, converted values to
    /// the text trace.
    pub fn append_sample(
        &mut self,
        time: f64,
        raw: &[u16; MAX_CHANNELS],
        values: &[f64; MAX_CHANNELS],
    ) -> io::Result<()> {
        let mut record = [0u8; RECORD_SIZE];
        LittleEndian::write_u16_into(raw, &mut record);
        self.bin.write_all(&record)?;

        let mut line = format!("{:.6}", time);
        for v in values {
            let _ = write!(line, " {:.3}", v);
        }
        line.push('\n');
        self.text.write_all(line.as_bytes())?;

        self.samples += 1;
        if self.samples % 1000 == 0 {
            self.bin.flush()?;
            self.text.flush()?;
        }
        Ok(())
    }

    /// Flush and close both files.
    pub fn stop(mut self) -> io::Result<RecordingSummary> {
        self.bin.flush()?;
        self.text.flush()?;
        info!(
            "Recording stopped: {} samples → {:?}",
            self.samples, self.binary_path
        );
        Ok(RecordingSummary {
            binary_path: self.binary_path.clone(),
            text_path: self.text_path.clone(),
            samples: self.samples,
        })
    }
}

/// `base`, or `base_N` if a trace with that name already exists.
fn unique_stem(dir: &Path, base: &str) -> String {
    let taken = |stem: &str| dir.join(format!("{}.bin", stem)).exists();
    if !taken(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{}_{}", base, n))
        .find(|s| !taken(s))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header() -> TraceHeader {
        let mut gains = [Gain::X1; MAX_CHANNELS];
        gains[1] = Gain::X8;
        gains[5] = Gain::X32;
        TraceHeader::new(AdcBits::B12, 1999.6, gains)
    }

    #[test]
    fn test_header_layout() {
        let mut buf = Vec::new();
        header().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(&buf[..4], &[12, 0, 0xD0, 0x07]); // 12 bits, 2000 Hz
        assert_eq!(&buf[6..8], &[4, 0]); // x8 is index 4
        let back = TraceHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(back, header());
    }

    #[test]
    fn test_header_rejects_bad_fields() {
        let mut buf = Vec::new();
        header().write_to(&mut buf).unwrap();

        let mut bad_bits = buf.clone();
        bad_bits[0] = 11;
        assert!(matches!(
            TraceHeader::read_from(&mut Cursor::new(bad_bits)),
            Err(FormatError::BadHeader(_))
        ));

        let mut zero_rate = buf.clone();
        zero_rate[2] = 0;
        zero_rate[3] = 0;
        assert!(TraceHeader::read_from(&mut Cursor::new(zero_rate)).is_err());

        let mut bad_gain = buf.clone();
        bad_gain[14] = 9;
        assert!(TraceHeader::read_from(&mut Cursor::new(bad_gain)).is_err());

        assert!(matches!(
            TraceHeader::read_from(&mut Cursor::new(&buf[..5])),
            Err(FormatError::Io(_))
        ));
    }

    #[test]
    fn test_record_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::start(dir.path(), 2, SignalUnit::Raw, header()).unwrap();
        rec.append_sample(0.0005, &[100, 200, 0, 0, 0, 0], &[100.0, 200.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();
        rec.append_sample(0.001, &[101, 201, 0, 0, 0, 0], &[-1.23456, 2.0, 0.0, 0.0, 0.0, 0.0])
            .unwrap();
        let summary = rec.stop().unwrap();
        assert_eq!(summary.samples, 2);

        let bin = fs::read(&summary.binary_path).unwrap();
        assert_eq!(bin.len(), HEADER_SIZE + 2 * RECORD_SIZE);
        assert_eq!(&bin[HEADER_SIZE..HEADER_SIZE + 4], &[100, 0, 200, 0]);

        let text = fs::read_to_string(&summary.text_path).unwrap();
        assert!(text.contains("Sample frequency: 2000"));
        let last = text.lines().last().unwrap();
        assert_eq!(last, "0.001000 -1.235 2.000 0.000 0.000 0.000 0.000");
    }

    #[test]
    fn test_unclosed_session_still_loads() {
        use crate::playback::Trace;

        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::start(dir.path(), 6, SignalUnit::Raw, header()).unwrap();
        // Well past one buffer's worth, so some of it has reached the disk.
        for i in 0..700u16 {
            let raw = [i, i + 1, i + 2, i + 3, i + 4, i + 5];
            rec.append_sample(i as f64 / 2000.0, &raw, &raw.map(f64::from))
                .unwrap();
        }
        let bin_path = rec.binary_path().to_path_buf();
        let text_path = bin_path.with_extension("txt");
        std::mem::forget(rec);

        let bin = fs::read(&bin_path).unwrap();
        assert_eq!((bin.len() - HEADER_SIZE) % RECORD_SIZE, 0);
        let trace = Trace::load(&bin_path).unwrap();
        assert!(trace.count() > 0 && trace.count() <= 700);
        assert_eq!(trace.header(), &header());
        for i in [0, trace.count() - 1] {
            let v = i as u16;
            assert_eq!(trace.record(i), [v, v + 1, v + 2, v + 3, v + 4, v + 5]);
        }

        let text = Trace::load(&text_path).unwrap();
        assert!(text.count() > 0 && text.count() <= 700);
        let last = (text.count() - 1) as u16;
        assert_eq!(text.record(text.count() - 1)[5], last + 5);
    }

    #[test]
    fn test_each_start_gets_a_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = Recorder::start(dir.path(), 1, SignalUnit::Raw, header()).unwrap().stop().unwrap();
        let b = Recorder::start(dir.path(), 1, SignalUnit::Raw, header()).unwrap().stop().unwrap();
        assert_ne!(a.binary_path, b.binary_path);
    }
}
