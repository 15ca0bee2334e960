pub mod config;
pub mod console_display;
pub mod coordinator;
pub mod decoder;
pub mod dsp;
pub mod error;
pub mod filter;
pub mod playback;
pub mod recorder;
pub mod ring;
pub mod simulator;
pub mod spectrum;
pub mod transport;
pub mod types;
