use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serialport::SerialPort;

use super::{fetch_image, http_agent, Dispatch, Transport};
use crate::error::TransportError;
use crate::logger;
use crate::types::{ActuationCommand, ClickKind, DeviceAck, Motion, Target, WorkArea};

pub const DEFAULT_BAUD: u32 = 115_200;
const READ_TIMEOUT: Duration = Duration::from_millis(100);
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Render one command as a protocol line, without the CRLF terminator.
pub fn format_command(cmd: &ActuationCommand) -> String {
    let a = &cmd.area;
    match cmd.motion {
        Motion::Move { at } => format!("move,{},{}", at.x, at.y),
        Motion::Home => "home".to_string(),
        Motion::Drag { from, to, .. } => {
            let (s, e) = (from.norm, to.norm);
            format!(
                "drag, {}, {}, {}, {}, {:.4}, {:.4}, {:.4}, {:.4}",
                a.origin_x, a.origin_y, a.extent_x, a.extent_y,
                s.x(), s.y(), e.x(), e.y()
            )
        }
        Motion::Click { at, speed } => click_line(a, ClickKind::Click, at, speed),
        Motion::DoubleClick { at, speed } => click_line(a, ClickKind::Double, at, speed),
        Motion::LongPress { at, speed, .. } => click_line(a, ClickKind::Long, at, speed),
    }
}

fn click_line(a: &WorkArea, kind: ClickKind, at: Target, speed: u32) -> String {
    let n = at.norm;
    format!(
        "move_click, {}, {}, {}, {}, {:.5}, {:.5}, {}, {}",
        a.origin_x, a.origin_y, a.extent_x, a.extent_y,
        n.x(), n.y(), kind.code(), speed
    )
}

/// Classify one device line. Anything else is chatter.
pub fn classify_line(line: &str) -> Option<DeviceAck> {
    let upper = line.to_ascii_uppercase();
    let is_err = upper.contains("ERROR")
        || upper.split(|c: char| !c.is_ascii_alphanumeric()).any(|tok| tok == "ERR");
    if is_err {
        Some(DeviceAck::Error(line.trim().to_string()))
    } else if upper.contains("READY") {
        Some(DeviceAck::Ready)
    } else {
        None
    }
}

/// Splits a byte stream into trimmed, non-empty text lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

/// Serial ports the OS reports, by name.
pub fn list_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            logger::warn_p("serial", &format!("port enumeration failed: {}", e));
            Vec::new()
        }
    }
}

/// GRBL-style controller on a serial line. Acks arrive asynchronously
/// through a listener thread reading the same port.
pub struct SerialTransport {
    port_name: String,
    writer: Box<dyn SerialPort>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    acks: Option<Receiver<DeviceAck>>,
    listener: Option<JoinHandle<()>>,
    capture: Option<(ureq::Agent, String)>,
}

impl SerialTransport {
    /// Open `port`, or the first enumerated port when none is given.
    pub fn open(port: Option<&str>, baud: u32) -> Result<Self, TransportError> {
        let port_name = match port {
            Some(p) => p.to_string(),
            None => list_ports().into_iter().next().ok_or(TransportError::NoPort)?,
        };
        logger::info_p("serial", &format!("opening {} at {} bps", port_name, baud));

        let writer = serialport::new(&port_name, baud).timeout(READ_TIMEOUT).open()?;
        let reader = writer.try_clone()?;

        let connected = Arc::new(AtomicBool::new(true));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();
        let listener = {
            let connected = connected.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("serial-listener".into())
                .spawn(move || listen(reader, tx, connected, running))?
        };

        Ok(Self {
            port_name,
            writer,
            connected,
            running,
            acks: Some(rx),
            listener: Some(listener),
            capture: None,
        })
    }

    /// Screenshots come from a separate camera/mirror endpoint.
    pub fn with_capture_url(mut self, url: &str) -> Self {
        self.capture = Some((http_agent(CAPTURE_TIMEOUT), url.to_string()));
        self
    }

}

fn listen(
    mut reader: Box<dyn SerialPort>,
    tx: Sender<DeviceAck>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) {
    let mut framer = LineFramer::new();
    let mut buf = [0u8; 256];
    while running.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for line in framer.push_bytes(&buf[..n]) {
                    match classify_line(&line) {
                        Some(ack) => {
                            logger::info_p("serial", &format!("rx {}", line));
                            if tx.send(ack).is_err() {
                                return;
                            }
                        }
                        None => logger::info_p("serial", &format!("rx (ignored) {}", line)),
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                logger::error_p("serial", &format!("read failed, link down: {}", e));
                connected.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

impl Transport for SerialTransport {
    fn name(&self) -> &str {
        "serial"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn execute(&mut self, cmd: &ActuationCommand) -> Result<Dispatch, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let line = format_command(cmd);
        logger::info_p("serial", &format!("tx {}", line));
        let written = self
            .writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .and_then(|_| self.writer.flush());
        if let Err(e) = written {
            logger::error_p("serial", &format!("write to {} failed, link down: {}", self.port_name, e));
            self.connected.store(false, Ordering::SeqCst);
            return Err(TransportError::Io(e));
        }
        Ok(Dispatch::AwaitAck)
    }

    fn screenshot(&mut self) -> Option<Vec<u8>> {
        let (agent, url) = self.capture.as_ref()?;
        fetch_image(agent, url, None, "serial")
    }

    fn take_acks(&mut self) -> Option<Receiver<DeviceAck>> {
        self.acks.take()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.listener.take() {
            h.join().ok();
        }
        logger::info_p("serial", &format!("closed {}", self.port_name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NormalizedPoint, PhysicalPoint, DEFAULT_SPEED};

    fn cmd(motion: Motion) -> ActuationCommand {
        ActuationCommand::new(motion, WorkArea::default())
    }

    fn target(x: i32, y: i32) -> Target {
        Target::from_point(PhysicalPoint::new(x, y), &WorkArea::default())
    }

    #[test]
    fn tap_line() {
        let line = format_command(&cmd(Motion::Click { at: target(1950, 3150), speed: DEFAULT_SPEED }));
        assert_eq!(line, "move_click, 0, 0, 3900, 6300, 0.50000, 0.50000, 1, 100");
    }

    #[test]
    fn click_kinds_and_speed() {
        let at = target(390, 630);
        let double = format_command(&cmd(Motion::DoubleClick { at, speed: 80 }));
        assert!(double.ends_with("0.10000, 0.10000, 2, 80"), "{double}");
        let long = format_command(&cmd(Motion::LongPress { at, speed: 100, duration_ms: 2000 }));
        assert!(long.ends_with(", 3, 100"), "{long}");
    }

    #[test]
    fn drag_move_home_lines() {
        let drag = format_command(&cmd(Motion::Drag {
            from: target(1950, 5985),
            to: target(1950, 1260),
            speed: DEFAULT_SPEED,
        }));
        assert_eq!(drag, "drag, 0, 0, 3900, 6300, 0.5000, 0.9500, 0.5000, 0.2000");
        assert_eq!(format_command(&cmd(Motion::Move { at: PhysicalPoint::new(10, 20) })), "move,10,20");
        assert_eq!(format_command(&cmd(Motion::Home)), "home");
    }

    #[test]
    fn offset_area_corners_are_sent() {
        let area = WorkArea::new(1200, 90, 3750, 6300);
        let line = format_command(&ActuationCommand::new(
            Motion::Click { at: Target::from_point(PhysicalPoint::new(1200, 90), &area), speed: 100 },
            area,
        ));
        assert_eq!(line, "move_click, 1200, 90, 3750, 6300, 0.00000, 0.00000, 1, 100");
    }

    #[test]
    fn commanded_fraction_is_sent_verbatim() {
        let area = WorkArea::default();
        let n = NormalizedPoint::new(0.12345, 0.54321).unwrap();
        let line = format_command(&ActuationCommand::new(Motion::Click { at: Target::new(n, &area), speed: 100 }, area));
        assert_eq!(line, "move_click, 0, 0, 3900, 6300, 0.12345, 0.54321, 1, 100");
    }

    #[test]
    fn classifies_device_lines() {
        assert_eq!(classify_line("READY"), Some(DeviceAck::Ready));
        assert_eq!(classify_line("ok ready"), Some(DeviceAck::Ready));
        assert_eq!(classify_line("ERROR: limit"), Some(DeviceAck::Error("ERROR: limit".into())));
        assert_eq!(classify_line("err:2"), Some(DeviceAck::Error("err:2".into())));
        assert_eq!(classify_line("Grbl 1.1h ['$' for help]"), None);
        assert_eq!(classify_line("interrupt"), None);
    }

    #[test]
    fn framer_handles_split_and_crlf() {
        let mut f = LineFramer::new();
        assert!(f.push_bytes(b"REA").is_empty());
        assert_eq!(f.push_bytes(b"DY\r\n\r\nok\nERR"), vec!["READY".to_string(), "ok".to_string()]);
        assert_eq!(f.push_bytes(b"OR\n"), vec!["ERROR".to_string()]);
    }
}
