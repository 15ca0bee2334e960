use crate::error::ConnectionError;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError, TrySendError};
use log::{debug, info, warn};
use serialport::SerialPort;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const BAUD_RATE: u32 = 115_200;

/// Anything that yields raw wire bytes without blocking.
///
/// `read_available` returns whatever has arrived since the last call, possibly
/// nothing. Faults are absorbed by the implementation; the caller only sees
/// an empty read and `is_connected() == false`.
pub trait ByteSource: Send {
    fn read_available(&mut self) -> Vec<u8>;

    /// Write one out-of-band control byte to the device.
    fn send_command(&mut self, byte: u8);

    fn is_connected(&self) -> bool;
}

/// Serial ports present on this machine, in the order the OS reports them.
pub fn list_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            warn!("Could not enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

// ─── Serial transport ───────────────────────────────────────────────────────

pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
    reconnects: u64,
}

impl SerialTransport {
    /// Open `port_name`, or the first listed port if `None`.
    pub fn connect(port_name: Option<&str>) -> Result<Self, ConnectionError> {
        let port_name = match port_name {
            Some(p) => p.to_string(),
            None => list_ports()
                .into_iter()
                .next()
                .ok_or(ConnectionError::NoPort)?,
        };
        let port = open_port(&port_name, BAUD_RATE)?;
        info!("Serial port {} opened @ {}", port_name, BAUD_RATE);
        Ok(Self {
            port_name,
            baud_rate: BAUD_RATE,
            port: Some(port),
            reconnects: 0,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn disconnect(&mut self) {
        if self.port.take().is_some() {
            info!("Serial port {} closed", self.port_name);
        }
    }

    /// Close whatever is open and try once to open the port again.
    fn reopen(&mut self) {
        self.port = None;
        self.reconnects += 1;
        match open_port(&self.port_name, self.baud_rate) {
            Ok(p) => {
                info!("Serial port {} reopened", self.port_name);
                self.port = Some(p);
            }
            Err(e) => debug!("Reconnect attempt {} failed: {}", self.reconnects, e),
        }
    }

    fn try_read(port: &mut dyn SerialPort) -> Result<Vec<u8>, ConnectionError> {
        let n = port
            .bytes_to_read()
            .map_err(|e| ConnectionError::Io(e.to_string()))? as usize;
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; n];
        let got = port
            .read(&mut buf)
            .map_err(|e| ConnectionError::Io(e.to_string()))?;
        buf.truncate(got);
        Ok(buf)
    }
}

fn open_port(name: &str, baud: u32) -> Result<Box<dyn SerialPort>, ConnectionError> {
    serialport::new(name, baud)
        .timeout(Duration::from_millis(10))
        .open()
        .map_err(|e| ConnectionError::Open {
            port: name.to_string(),
            reason: e.to_string(),
        })
}

impl ByteSource for SerialTransport {
    fn read_available(&mut self) -> Vec<u8> {
        let Some(port) = self.port.as_mut() else {
            self.reopen();
            return Vec::new();
        };
        match Self::try_read(&mut **port) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{}; reconnecting", e);
                self.reopen();
                Vec::new()
            }
        }
    }

    fn send_command(&mut self, byte: u8) {
        let Some(port) = self.port.as_mut() else {
            warn!("Dropping command 0x{:02X}: port closed", byte);
            return;
        };
        if let Err(e) = port.write_all(&[byte]) {
            warn!("Failed to send command 0x{:02X}: {}", byte, e);
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ─── Background poller ──────────────────────────────────────────────────────

/// Delay between polls of the wrapped source.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Bytes the poller holds for a reader that is not draining (about 20 s of
/// traffic at [`BAUD_RATE`]). Chunks beyond this are dropped and counted.
pub const MAX_QUEUED_BYTES: usize = 256 * 1024;

/// Upper bound on queued chunks, whatever their size.
const MAX_QUEUED_CHUNKS: usize = 8192;

/// Runs a [`ByteSource`] on its own thread so slow hardware reads never stall
/// the tick. The thread only moves bytes: chunks arrive in FIFO order over a
/// channel and are concatenated on read. Commands travel the other way.
///
/// The queue is bounded by a byte budget. While the reader is not draining
/// (a paused pipeline) new chunks are dropped once the budget is full, and
/// the decoder resynchronises at the next marker.
pub struct ThreadedSource {
    bytes_rx: Receiver<Vec<u8>>,
    cmd_tx: Option<Sender<u8>>,
    connected: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
    dropped: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedSource {
    pub fn spawn<S: ByteSource + 'static>(source: S) -> Self {
        Self::spawn_with_limit(source, MAX_QUEUED_BYTES)
    }

    /// Like [`spawn`](Self::spawn) with a custom byte budget.
    pub fn spawn_with_limit<S: ByteSource + 'static>(mut source: S, max_bytes: usize) -> Self {
        let (bytes_tx, bytes_rx) = bounded::<Vec<u8>>(MAX_QUEUED_CHUNKS);
        let (cmd_tx, cmd_rx) = unbounded::<u8>();
        let connected = Arc::new(AtomicBool::new(source.is_connected()));
        let flag = connected.clone();
        let queued = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let (queued_in, dropped_in) = (queued.clone(), dropped.clone());

        let handle = thread::Builder::new()
            .name("byte-poller".into())
            .spawn(move || {
                let mut overflowing = false;
                loop {
                    loop {
                        match cmd_rx.try_recv() {
                            Ok(byte) => source.send_command(byte),
                            Err(TryRecvError::Empty) => break,
                            Err(TryRecvError::Disconnected) => return,
                        }
                    }
                    let chunk = source.read_available();
                    flag.store(source.is_connected(), Ordering::Relaxed);
                    if !chunk.is_empty() {
                        let len = chunk.len();
                        let over_budget =
                            queued_in.fetch_add(len, Ordering::AcqRel) + len > max_bytes;
                        let accepted = if over_budget {
                            false
                        } else {
                            match bytes_tx.try_send(chunk) {
                                Ok(()) => true,
                                Err(TrySendError::Full(_)) => false,
                                Err(TrySendError::Disconnected(_)) => return,
                            }
                        };
                        if accepted {
                            if overflowing {
                                info!("Byte queue draining again");
                                overflowing = false;
                            }
                        } else {
                            queued_in.fetch_sub(len, Ordering::AcqRel);
                            dropped_in.fetch_add(len as u64, Ordering::Release);
                            if !overflowing {
                                warn!("Byte queue full ({} bytes), dropping input", max_bytes);
                                overflowing = true;
                            }
                        }
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            });

        let handle = match handle {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("Could not start byte poller: {}", e);
                connected.store(false, Ordering::Relaxed);
                None
            }
        };

        Self {
            bytes_rx,
            cmd_tx: Some(cmd_tx),
            connected,
            queued,
            dropped,
            handle,
        }
    }

    /// Bytes waiting for the next [`read_available`](ByteSource::read_available).
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Bytes discarded because the queue was full.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }
}

impl ByteSource for ThreadedSource {
    fn read_available(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in self.bytes_rx.try_iter() {
            self.queued.fetch_sub(chunk.len(), Ordering::AcqRel);
            out.extend_from_slice(&chunk);
        }
        out
    }

    fn send_command(&mut self, byte: u8) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(byte);
        }
    }

    fn is_connected(&self) -> bool {
        self.handle.is_some() && self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for ThreadedSource {
    fn drop(&mut self) {
        // Closing the command channel tells the poller to exit; it drops the
        // wrapped source (and its port) on the way out.
        self.cmd_tx = None;
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}
