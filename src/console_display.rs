use crate::coordinator::{Coordinator, Mode};
use std::fmt::Write as _;
use std::io::{self, Write};

/// Width of the envelope bars, in characters.
const BAR_WIDTH: usize = 40;

/// Renders a live ASCII dashboard of the pipeline state: one envelope bar
/// per active channel plus the dominant frequency of the selected channel.
pub struct ConsoleDisplay {
    /// Redraw once every this many calls to [`show`](Self::show).
    every: u64,
    calls: u64,
    /// Envelope value that fills a bar; grows to fit the largest seen.
    full_scale: f64,
}

impl ConsoleDisplay {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            calls: 0,
            full_scale: 1.0,
        }
    }

    /// Redraw the terminal if this call is due.
    pub fn show(&mut self, coord: &Coordinator) {
        self.calls += 1;
        if self.calls % self.every != 0 {
            return;
        }
        let frame = self.render(coord);
        let mut stdout = io::stdout();
        // Clear screen and move cursor home
        let _ = write!(stdout, "\x1b[2J\x1b[H{}", frame);
        let _ = stdout.flush();
    }

    pub fn render(&mut self, coord: &Coordinator) -> String {
        let cfg = coord.config();
        let mut out = String::new();
        let mode = match coord.mode() {
            Mode::Idle => "idle".to_string(),
            Mode::Live if coord.is_connected() => "live".to_string(),
            Mode::Live => "live (disconnected)".to_string(),
            Mode::Replay => format!(
                "replay {:5.1}%",
                coord.playback_position().unwrap_or(0.0)
            ),
        };

        let _ = writeln!(out, "╔══════════════════════════════════════════════════════════╗");
        let _ = writeln!(out, "║  MYO CAPTURE  Live Monitor");
        let _ = writeln!(out, "╠══════════════════════════════════════════════════════════╣");
        let _ = writeln!(
            out,
            "║  Source: {}   Rate: {:.1} Hz   Time: {:.2}s",
            mode,
            coord.rate_hz(),
            coord.times().last().unwrap_or(0.0)
        );
        if coord.is_paused() {
            let _ = writeln!(out, "║  [paused]");
        }
        if coord.is_recording() {
            let _ = writeln!(out, "║  ● REC  {} samples", coord.recorded_samples());
        }

        let _ = writeln!(out, "║");
        let _ = writeln!(out, "║  Envelope:");
        let levels: Vec<f64> = (0..cfg.channel_count)
            .map(|ch| coord.latest_envelope(ch))
            .collect();
        let peak = levels.iter().cloned().fold(0.0, f64::max);
        if peak > self.full_scale {
            self.full_scale = peak;
        }
        for (ch, &level) in levels.iter().enumerate() {
            let marker = if ch == cfg.selected_channel { '>' } else { ' ' };
            let _ = writeln!(
                out,
                "║  {}ch{} {:>4} {} {:8.2}",
                marker,
                ch + 1,
                cfg.gains[ch].to_string(),
                make_bar(level / self.full_scale, BAR_WIDTH),
                level
            );
        }

        let _ = writeln!(out, "║");
        match coord.spectrum_peak() {
            Some(f) => {
                let _ = writeln!(
                    out,
                    "║  Spectrum ch{}: peak {:.1} Hz",
                    cfg.selected_channel + 1,
                    f
                );
            }
            None => {
                let _ = writeln!(out, "║  Spectrum: ---");
            }
        }

        let stats = coord.decode_stats();
        let _ = writeln!(
            out,
            "║  Frames: {}   Sync errors: {}   Dropped bytes: {}",
            stats.frames, stats.sync_errors, stats.dropped_bytes
        );
        let _ = writeln!(out, "╚══════════════════════════════════════════════════════════╝");
        out
    }
}

fn make_bar(val: f64, width: usize) -> String {
    let filled = (val.clamp(0.0, 1.0) * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}
