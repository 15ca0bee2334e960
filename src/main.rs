use myo_capture::config::PipelineConfig;
use myo_capture::console_display::ConsoleDisplay;
use myo_capture::coordinator::Coordinator;
use myo_capture::simulator::SimulatedDevice;
use myo_capture::transport::{self, SerialTransport, ThreadedSource};
use myo_capture::types::*;

use clap::{Parser, ValueEnum};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NotchArg {
    Off,
    #[value(name = "50")]
    Hz50,
    #[value(name = "60")]
    Hz60,
}

impl From<NotchArg> for Mains {
    fn from(n: NotchArg) -> Self {
        match n {
            NotchArg::Off => Mains::Off,
            NotchArg::Hz50 => Mains::Hz50,
            NotchArg::Hz60 => Mains::Hz60,
        }
    }
}

#[derive(Parser)]
#[command(name = "myo-capture")]
#[command(about = "Multi-channel EMG acquisition, filtering, recording and playback")]
struct Cli {
    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Run against a simulated sensor (no hardware required)
    #[arg(long)]
    simulate: bool,

    /// Serial port of the sensor board (default: first port found)
    #[arg(long)]
    port: Option<String>,

    /// Replay a recorded trace (.bin, or its .txt twin) instead of acquiring live
    #[arg(long)]
    playback: Option<PathBuf>,

    /// Start playback at this position (0–100)
    #[arg(long, default_value_t = 0.0)]
    seek: f64,

    /// Record everything that passes through the pipeline
    #[arg(long)]
    record: bool,

    /// Output directory for recordings
    #[arg(long, default_value = "./recordings")]
    output_dir: PathBuf,

    /// Pipeline config file (JSON); command-line options override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective config to this file and continue
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Active channels (1–6)
    #[arg(long)]
    channels: Option<usize>,

    /// ADC resolution in bits (8, 10, 12, 14, 16)
    #[arg(long)]
    adc_bits: Option<u16>,

    /// Present values in millivolts instead of raw ADC counts
    #[arg(long)]
    millivolts: bool,

    /// Bandpass low cutoff (Hz)
    #[arg(long)]
    low: Option<f64>,

    /// Bandpass high cutoff (Hz)
    #[arg(long)]
    high: Option<f64>,

    /// Disable the bandpass stage
    #[arg(long)]
    no_bandpass: bool,

    /// Mains notch
    #[arg(long, value_enum)]
    notch: Option<NotchArg>,

    /// Stop after this many seconds (default: run until killed)
    #[arg(long)]
    seconds: Option<f64>,

    /// Enable console display (terminal TUI, for headless/debug)
    #[arg(long)]
    console: bool,

    /// Redraw the console every N ticks
    #[arg(long, default_value_t = 3)]
    display_every: u64,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut cfg = self
            .config
            .as_deref()
            .and_then(PipelineConfig::load)
            .unwrap_or_default();
        if let Some(n) = self.channels {
            cfg.channel_count = n;
        }
        if let Some(bits) = self.adc_bits {
            match AdcBits::from_bits(bits) {
                Some(adc) => cfg.adc_bits = adc,
                None => warn!("Unsupported ADC resolution {}, keeping {}", bits, cfg.adc_bits.bits()),
            }
        }
        if self.millivolts {
            cfg.signal_unit = SignalUnit::Millivolts;
        }
        if let Some(low) = self.low {
            cfg.filter.bandpass.low_hz = low;
        }
        if let Some(high) = self.high {
            cfg.filter.bandpass.high_hz = high;
        }
        if self.no_bandpass {
            cfg.filter.bandpass.enabled = false;
        }
        if let Some(n) = self.notch {
            cfg.filter.notch = n.into();
        }
        cfg.sanitized()
    }
}

/// Run length from `--seconds`. Negative, NaN or overflowing values are
/// ignored with a warning and the run is unbounded.
fn run_limit(seconds: Option<f64>) -> Option<Duration> {
    let s = seconds?;
    match Duration::try_from_secs_f64(s) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!("Ignoring --seconds {}: {}", s, e);
            None
        }
    }
}

fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .init();

    let cli = Cli::parse();

    if cli.list_ports {
        let ports = transport::list_ports();
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for p in ports {
            println!("{}", p);
        }
        return;
    }

    let cfg = cli.pipeline_config();
    if let Some(path) = &cli.save_config {
        if let Err(e) = cfg.save(path) {
            error!("Could not save config to {:?}: {}", path, e);
        }
    }

    info!("═══════════════════════════════════════════════");
    info!("  MYO CAPTURE v{}", env!("CARGO_PKG_VERSION"));
    info!("  Channels: {}   ADC: {} bit", cfg.channel_count, cfg.adc_bits.bits());
    info!(
        "  Bandpass: {}   Notch: {:?}",
        if cfg.filter.bandpass.enabled {
            format!("{}–{} Hz", cfg.filter.bandpass.low_hz, cfg.filter.bandpass.high_hz)
        } else {
            "off".to_string()
        },
        cfg.filter.notch
    );
    if cli.console { info!("  UI: Console TUI"); }
    info!("═══════════════════════════════════════════════");

    let mut coord = Coordinator::new(cfg.clone(), &cli.output_dir);

    // ─── Source ─────────────────────────────────────────────────────
    if let Some(path) = &cli.playback {
        if let Err(e) = coord.start_playback(path) {
            error!("Cannot play {:?}: {}", path, e);
            std::process::exit(1);
        }
        if cli.seek > 0.0 {
            coord.seek(cli.seek);
        }
    } else if cli.simulate {
        info!("Starting simulated sensor...");
        let dev = SimulatedDevice::new(cfg.channel_count, cfg.nominal_rate_hz)
            .with_adc(cfg.adc_bits);
        coord.start_live(Box::new(dev));
    } else {
        match SerialTransport::connect(cli.port.as_deref()) {
            Ok(serial) => coord.start_live(Box::new(ThreadedSource::spawn(serial))),
            Err(e) => {
                error!("{}", e);
                error!("Is the sensor connected? Run with --simulate for dev mode.");
                std::process::exit(1);
            }
        }
    }

    if cli.record {
        match coord.start_recording() {
            Ok(path) => info!("Recording to {:?}", path),
            Err(e) => error!("Could not start recording: {}", e),
        }
    }

    // ─── Tick loop ──────────────────────────────────────────────────
    let mut display = cli.console.then(|| ConsoleDisplay::new(cli.display_every));
    let started = Instant::now();
    let deadline = run_limit(cli.seconds);

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    if let Err(e) = ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }
    info!("Running. Press Ctrl+C to stop.");

    while running.load(Ordering::SeqCst) {
        let tick_start = Instant::now();
        coord.tick();
        if let Some(d) = display.as_mut() {
            d.show(&coord);
        }
        if deadline.is_some_and(|d| started.elapsed() >= d) {
            break;
        }
        let interval = coord.config().tick_interval();
        if let Some(rest) = interval.checked_sub(tick_start.elapsed()) {
            thread::sleep(rest);
        }
    }

    if !running.load(Ordering::SeqCst) {
        info!("Interrupted, shutting down");
    }
    match coord.stop_recording() {
        Ok(Some(summary)) => info!(
            "Saved {} samples to {:?} and {:?}",
            summary.samples, summary.binary_path, summary.text_path
        ),
        Ok(None) => {}
        Err(e) => error!("Failed to close recording: {}", e),
    }
    let stats = coord.stats();
    let decode = coord.decode_stats();
    info!(
        "Done: {} ticks, {} samples, {} frames, {} sync errors",
        stats.ticks, stats.samples, decode.frames, decode.sync_errors
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_limit_rejects_bad_seconds() {
        assert_eq!(run_limit(None), None);
        assert_eq!(run_limit(Some(2.5)), Some(Duration::from_millis(2500)));
        assert_eq!(run_limit(Some(-1.0)), None);
        assert_eq!(run_limit(Some(f64::NAN)), None);
        assert_eq!(run_limit(Some(f64::INFINITY)), None);
    }
}
