use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::serial::format_command;
use super::{Dispatch, Transport};
use crate::error::TransportError;
use crate::logger;
use crate::types::{ActuationCommand, DeviceAck};

/// A 1x1 transparent PNG, served as the stub screen.
pub const STUB_PNG: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F, 0x15, 0xC4,
    0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00, 0x01, 0x00, 0x00,
    0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4E, 0x44, 0xAE,
    0x42, 0x60, 0x82,
];

/// How the fake device answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Motions finish inside `execute`, like the HTTP transport.
    Immediate,
    /// A fake controller sends READY after `delay`, like the serial transport.
    Device { delay: Duration },
    /// Never answers.
    Silent,
}

/// Shared view into a stub transport, kept by tests after the transport
/// moves into the queue.
#[derive(Debug, Clone, Default)]
pub struct StubProbe {
    commands: Arc<Mutex<Vec<ActuationCommand>>>,
    lines: Arc<Mutex<Vec<String>>>,
    outstanding: Arc<AtomicUsize>,
    max_outstanding: Arc<AtomicUsize>,
    screenshots: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
}

impl StubProbe {
    pub fn commands(&self) -> Vec<ActuationCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Commands rendered in the serial wire format.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// Highest number of writes ever left unacknowledged at once.
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    pub fn screenshots_taken(&self) -> usize {
        self.screenshots.load(Ordering::SeqCst)
    }

    /// Simulate link loss.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// In-memory transport for `--stub` runs and tests. Logs every motion.
pub struct StubTransport {
    mode: AckMode,
    probe: StubProbe,
    screen: Option<Vec<u8>>,
    ack_tx: Sender<DeviceAck>,
    acks: Option<Receiver<DeviceAck>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::with_mode(AckMode::Immediate)
    }

    pub fn with_mode(mode: AckMode) -> Self {
        let (ack_tx, rx) = mpsc::channel();
        let probe = StubProbe::default();
        probe.connected.store(true, Ordering::SeqCst);
        Self { mode, probe, screen: Some(STUB_PNG.to_vec()), ack_tx, acks: Some(rx) }
    }

    /// Replace the screen image; `None` makes every capture fail.
    pub fn with_screen(mut self, screen: Option<Vec<u8>>) -> Self {
        self.screen = screen;
        self
    }

    pub fn probe(&self) -> StubProbe {
        self.probe.clone()
    }

    /// Extra device lines, e.g. a stale READY.
    pub fn ack_sender(&self) -> Sender<DeviceAck> {
        self.ack_tx.clone()
    }
}

impl Default for StubTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for StubTransport {
    fn name(&self) -> &str {
        "stub"
    }

    fn is_connected(&self) -> bool {
        self.probe.connected.load(Ordering::SeqCst)
    }

    fn execute(&mut self, cmd: &ActuationCommand) -> Result<Dispatch, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let line = format_command(cmd);
        logger::info_p("stub", &format!("tx {}", line));
        self.probe.commands.lock().unwrap().push(*cmd);
        self.probe.lines.lock().unwrap().push(line);

        match self.mode {
            AckMode::Immediate => Ok(Dispatch::Completed),
            AckMode::Silent => Ok(Dispatch::AwaitAck),
            AckMode::Device { delay } => {
                let now = self.probe.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                self.probe.max_outstanding.fetch_max(now, Ordering::SeqCst);
                let outstanding = self.probe.outstanding.clone();
                let tx = self.ack_tx.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    outstanding.fetch_sub(1, Ordering::SeqCst);
                    tx.send(DeviceAck::Ready).ok();
                });
                Ok(Dispatch::AwaitAck)
            }
        }
    }

    fn screenshot(&mut self) -> Option<Vec<u8>> {
        self.probe.screenshots.fetch_add(1, Ordering::SeqCst);
        self.screen.clone()
    }

    fn take_acks(&mut self) -> Option<Receiver<DeviceAck>> {
        self.acks.take()
    }
}
