use crate::error::DecodeStats;
use crate::types::*;
use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, trace};
use std::io::{self, Cursor};

/// Wire protocol from the sensor board:
///
/// | Size        | Field                                   |
/// |-------------|-----------------------------------------|
/// | 2 × N       | raw ADC per active channel (u16 LE)     |
/// | 2           | delta-time since previous frame (µs LE) |
///
/// Frames are sent back-to-back in bursts; each burst ends with `0xFF 0xFF`.
/// A read may end anywhere, so whatever follows the last marker is held back
/// and prefixed to the next read.
pub struct FrameDecoder {
    channels: usize,
    carry: Vec<u8>,
    /// Set after a channel-count change: bytes up to the next marker were
    /// framed with the old size and are skipped.
    resync: bool,
    stats: DecodeStats,
}

/// Carry-over larger than this many frames without a marker is garbage.
const MAX_CARRY_FRAMES: usize = 512;

impl FrameDecoder {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: channels.clamp(1, MAX_CHANNELS),
            carry: Vec::with_capacity(frame_size(MAX_CHANNELS) * 64),
            resync: false,
            stats: DecodeStats::default(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frame_size(&self) -> usize {
        frame_size(self.channels)
    }

    /// Unconsumed bytes waiting for the next burst marker.
    pub fn carry_over(&self) -> &[u8] {
        &self.carry
    }

    pub fn stats(&self) -> DecodeStats {
        self.stats
    }

    /// Switch frame size. Data already in flight uses the old size, so the
    /// decoder discards up to the next marker before framing again.
    pub fn set_channel_count(&mut self, channels: usize) {
        let channels = channels.clamp(1, MAX_CHANNELS);
        if channels == self.channels {
            return;
        }
        debug!("Decoder: {} → {} channels, resyncing", self.channels, channels);
        self.channels = channels;
        self.stats.dropped_bytes += self.carry.len() as u64;
        self.carry.clear();
        self.resync = true;
    }

    /// Forget carry-over (counters are kept).
    pub fn reset(&mut self) {
        self.carry.clear();
        self.resync = false;
    }

    /// Decode one chunk of serial bytes into zero or more frames.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<SampleFrame> {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(chunk);

        if self.resync {
            match find_marker(&buf, 0) {
                Some(pos) => {
                    self.stats.dropped_bytes += pos as u64;
                    self.stats.markers += 1;
                    buf.drain(..pos + 2);
                    self.resync = false;
                }
                None => {
                    self.stats.dropped_bytes += buf.len() as u64;
                    buf.clear();
                    self.carry = buf;
                    return Vec::new();
                }
            }
        }

        let Some(last) = rfind_marker(&buf) else {
            if buf.len() > MAX_CARRY_FRAMES * self.frame_size() {
                debug!("Decoder: {} bytes without a marker, discarding", buf.len());
                self.stats.sync_errors += 1;
                self.stats.dropped_bytes += buf.len() as u64;
                buf.clear();
            }
            self.carry = buf;
            return Vec::new();
        };

        self.carry = buf[last + 2..].to_vec();
        self.stats.markers += 1;
        let frames = self.decode_bursts(&buf[..last]);
        trace!(
            "Decoder: {} frames, {} bytes carried",
            frames.len(),
            self.carry.len()
        );
        frames
    }

    /// Split the region before the final marker into bursts. An inner marker
    /// only counts as a boundary when the bytes before it form whole frames;
    /// otherwise it is sample data that happens to read 0xFFFF.
    fn decode_bursts(&mut self, body: &[u8]) -> Vec<SampleFrame> {
        let size = self.frame_size();
        let mut frames = Vec::with_capacity(body.len() / size);
        let mut start = 0;
        let mut search = 0;

        while let Some(m) = find_marker(body, search) {
            if (m - start) % size == 0 {
                self.slice_frames(&body[start..m], &mut frames);
                self.stats.markers += 1;
                start = m + 2;
                search = start;
            } else {
                search = m + 1;
            }
        }

        let tail = &body[start..];
        let whole = tail.len() / size * size;
        self.slice_frames(&tail[..whole], &mut frames);
        if whole != tail.len() {
            self.stats.sync_errors += 1;
            self.stats.dropped_bytes += (tail.len() - whole) as u64;
            debug!(
                "Decoder: burst of {} bytes is not a multiple of {}, dropped {} trailing",
                tail.len(),
                size,
                tail.len() - whole
            );
        }
        frames
    }

    fn slice_frames(&mut self, data: &[u8], out: &mut Vec<SampleFrame>) {
        for chunk in data.chunks_exact(self.frame_size()) {
            match parse_frame(chunk, self.channels) {
                Ok(frame) => {
                    out.push(frame);
                    self.stats.frames += 1;
                }
                Err(e) => {
                    self.stats.sync_errors += 1;
                    self.stats.dropped_bytes += chunk.len() as u64;
                    debug!("Frame parse error: {}", e);
                }
            }
        }
    }
}

/// First marker at or after `from`.
fn find_marker(buf: &[u8], from: usize) -> Option<usize> {
    (from..buf.len().saturating_sub(1))
        .find(|&i| buf[i] == BURST_MARKER[0] && buf[i + 1] == BURST_MARKER[1])
}

/// Last marker in the buffer, scanning from the end. In a run of three or
/// more 0xFF bytes the marker is taken at the start of the run. The byte
/// before a marker is the high byte of a delta-time, so this assumes frame
/// intervals below 0xFF00 µs.
fn rfind_marker(buf: &[u8]) -> Option<usize> {
    let mut pos = (0..buf.len().saturating_sub(1))
        .rev()
        .find(|&i| buf[i] == BURST_MARKER[0] && buf[i + 1] == BURST_MARKER[1])?;
    while pos > 0 && buf[pos - 1] == BURST_MARKER[0] {
        pos -= 1;
    }
    Some(pos)
}

fn parse_frame(data: &[u8], channels: usize) -> io::Result<SampleFrame> {
    let mut cursor = Cursor::new(data);
    let mut raw = [0u16; MAX_CHANNELS];
    for value in raw.iter_mut().take(channels) {
        *value = cursor.read_u16::<LittleEndian>()?;
    }
    let dt_us = cursor.read_u16::<LittleEndian>()?;
    Ok(SampleFrame {
        raw,
        channels,
        dt_us,
    })
}

/// Encode frames as one burst, marker included. Used by the simulated
/// device and by tests.
pub fn encode_burst(frames: &[SampleFrame], out: &mut Vec<u8>) {
    for frame in frames {
        for &v in frame.active() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&frame.dt_us.to_le_bytes());
    }
    out.extend_from_slice(&BURST_MARKER);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn frame2(a: u16, b: u16, dt: u16) -> SampleFrame {
        let mut raw = [0u16; MAX_CHANNELS];
        raw[0] = a;
        raw[1] = b;
        SampleFrame {
            raw,
            channels: 2,
            dt_us: dt,
        }
    }

    fn five_frames() -> Vec<SampleFrame> {
        (0..5).map(|i| frame2(10 + i, 20 + i, 500)).collect()
    }

    #[test]
    fn test_five_frames_two_channels() {
        let mut bytes = Vec::new();
        encode_burst(&five_frames(), &mut bytes);
        assert_eq!(bytes.len(), 32);

        let mut dec = FrameDecoder::new(2);
        let frames = dec.decode(&bytes);
        assert_eq!(frames.len(), 5);
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.active(), &[10 + i as u16, 20 + i as u16]);
            assert_eq!(f.dt_us, 500);
        }
        assert!(dec.carry_over().is_empty());
        assert_eq!(dec.stats().sync_errors, 0);
    }

    #[test]
    fn test_sixteen_bit_samples_and_long_intervals() {
        // 0xFF high bytes in the samples, and a delta-time just under 0xFF00.
        let frames = vec![frame2(0xFFF0, 0xFF7F, 500), frame2(0xFFF1, 0x00FF, 0xFEFF)];
        let mut bytes = Vec::new();
        encode_burst(&frames, &mut bytes);

        let mut dec = FrameDecoder::new(2);
        let out = dec.decode(&bytes);
        assert_eq!(out, frames);
        assert!(dec.carry_over().is_empty());
        assert_eq!(dec.stats().sync_errors, 0);
    }

    #[test]
    fn test_carry_over_across_reads() {
        let mut bytes = Vec::new();
        encode_burst(&five_frames(), &mut bytes);
        let mut second = Vec::new();
        encode_burst(&[frame2(99, 98, 500)], &mut second);
        bytes.extend_from_slice(&second[..3]);

        let mut dec = FrameDecoder::new(2);
        assert_eq!(dec.decode(&bytes).len(), 5);
        assert_eq!(dec.carry_over(), &second[..3]);

        let frames = dec.decode(&second[3..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].active(), &[99, 98]);
        assert!(dec.carry_over().is_empty());
    }

    #[test]
    fn test_marker_split_between_reads() {
        let mut bytes = Vec::new();
        encode_burst(&five_frames(), &mut bytes);
        let mut dec = FrameDecoder::new(2);
        assert!(dec.decode(&bytes[..31]).is_empty());
        assert_eq!(dec.carry_over().len(), 31);
        assert_eq!(dec.decode(&bytes[31..]).len(), 5);
        assert!(dec.carry_over().is_empty());
    }

    #[test]
    fn test_trailing_partial_frame_dropped() {
        let mut bytes = Vec::new();
        for f in five_frames() {
            for v in f.active() {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            bytes.extend_from_slice(&f.dt_us.to_le_bytes());
        }
        bytes.extend_from_slice(&[0x01, 0x02, 0x03]);
        bytes.extend_from_slice(&BURST_MARKER);

        let mut dec = FrameDecoder::new(2);
        let frames = dec.decode(&bytes);
        assert_eq!(frames.len(), 5);
        assert_eq!(dec.stats().sync_errors, 1);
        assert_eq!(dec.stats().dropped_bytes, 3);
    }

    #[test]
    fn test_multiple_bursts_in_one_read() {
        let mut bytes = Vec::new();
        encode_burst(&five_frames(), &mut bytes);
        encode_burst(&[frame2(1, 2, 400), frame2(3, 4, 400)], &mut bytes);
        let mut dec = FrameDecoder::new(2);
        let frames = dec.decode(&bytes);
        assert_eq!(frames.len(), 7);
        assert_eq!(frames[6].active(), &[3, 4]);
        assert_eq!(dec.stats().sync_errors, 0);
    }

    #[test]
    fn test_ffff_inside_frame_is_not_a_boundary() {
        // dt of 0xFFFF in the middle of a burst
        let frames_in = vec![frame2(5, 6, 0xFFFF), frame2(7, 8, 500)];
        let mut bytes = Vec::new();
        encode_burst(&frames_in, &mut bytes);
        let mut dec = FrameDecoder::new(2);
        let frames = dec.decode(&bytes);
        assert_eq!(frames, frames_in);
    }

    #[test]
    fn test_no_marker_accumulates() {
        let mut dec = FrameDecoder::new(2);
        assert!(dec.decode(&[1, 0, 2, 0]).is_empty());
        assert_eq!(dec.carry_over().len(), 4);
        assert!(dec.decode(&[0xF4, 0x01, 0xFF, 0xFF]).len() == 1);
    }

    #[test]
    fn test_runaway_carry_discarded() {
        let mut dec = FrameDecoder::new(1);
        let junk = vec![0x11u8; MAX_CARRY_FRAMES * 4 + 1];
        assert!(dec.decode(&junk).is_empty());
        assert!(dec.carry_over().is_empty());
        assert_eq!(dec.stats().dropped_bytes, junk.len() as u64);
    }

    #[test]
    fn test_channel_change_resyncs_at_next_marker() {
        let mut dec = FrameDecoder::new(2);
        let mut old = Vec::new();
        encode_burst(&five_frames(), &mut old);
        dec.decode(&old[..10]);
        dec.set_channel_count(1);
        assert!(dec.carry_over().is_empty());

        // Remainder of the old-format burst, then a new 1-channel burst.
        let mut bytes = old[10..].to_vec();
        let mut one = [0u16; MAX_CHANNELS];
        one[0] = 777;
        encode_burst(
            &[SampleFrame {
                raw: one,
                channels: 1,
                dt_us: 500,
            }],
            &mut bytes,
        );
        let frames = dec.decode(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].active(), &[777]);
    }

    #[test]
    fn test_byte_conservation_random_chunking() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut stream = Vec::new();
        let mut expected = 0u64;
        for _ in 0..50 {
            let n = rng.gen_range(1..20);
            let burst: Vec<SampleFrame> = (0..n)
                .map(|_| frame2(rng.gen_range(0..1024), rng.gen_range(0..1024), 500))
                .collect();
            expected += n as u64;
            encode_burst(&burst, &mut stream);
        }

        let mut dec = FrameDecoder::new(2);
        let mut decoded = 0u64;
        let mut pos = 0;
        while pos < stream.len() {
            let len = rng.gen_range(1..64).min(stream.len() - pos);
            decoded += dec.decode(&stream[pos..pos + len]).len() as u64;
            pos += len;

            let s = dec.stats();
            let accounted = s.frames * dec.frame_size() as u64
                + s.markers * 2
                + s.dropped_bytes
                + dec.carry_over().len() as u64;
            assert_eq!(accounted, pos as u64);
        }
        assert_eq!(decoded, expected);
        assert_eq!(dec.stats().sync_errors, 0);
    }
}
