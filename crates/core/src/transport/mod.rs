pub mod serial;
pub mod stub;
pub mod wifi;

use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::error::TransportError;
use crate::logger;
use crate::settings::TransportSettings;
use crate::types::{ActuationCommand, DeviceAck};

/// What the queue has to do after a command was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The device reports completion later on the ack stream.
    AwaitAck,
    /// The motion already finished inside `execute`.
    Completed,
}

/// One physical link to the actuator.
///
/// Only the command queue calls `execute`, one command at a time.
pub trait Transport: Send {
    fn name(&self) -> &str;
    fn is_connected(&self) -> bool;
    /// Write exactly one motion to the device.
    fn execute(&mut self, cmd: &ActuationCommand) -> Result<Dispatch, TransportError>;
    /// Current screen image, or `None` when no valid image is available.
    fn screenshot(&mut self) -> Option<Vec<u8>>;
    /// Hand the ack stream to the queue. Yields `Some` at most once.
    fn take_acks(&mut self) -> Option<Receiver<DeviceAck>> {
        None
    }
}

/// Create the transport described by `settings`.
pub fn create_transport(
    settings: &TransportSettings,
    force_stub: bool,
) -> Result<Box<dyn Transport>, TransportError> {
    if force_stub {
        return Ok(Box::new(stub::StubTransport::new()));
    }
    match settings {
        TransportSettings::Serial { port, baud, capture_url } => {
            let mut t = serial::SerialTransport::open(port.as_deref(), *baud)?;
            if let Some(url) = capture_url {
                t = t.with_capture_url(url);
            }
            Ok(Box::new(t))
        }
        TransportSettings::Wifi { ip, port, username, password } => {
            let base = format!("http://{}:{}", ip, port);
            Ok(Box::new(wifi::WifiTransport::connect(&base, username, password)?))
        }
        TransportSettings::Stub => Ok(Box::new(stub::StubTransport::new())),
    }
}

/// True when the bytes carry a recognizable image header.
pub fn is_image(bytes: &[u8]) -> bool {
    !bytes.is_empty() && image::guess_format(bytes).is_ok()
}

pub(crate) fn http_agent(timeout: Duration) -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(timeout))
        .http_status_as_error(false)
        .max_redirects(0)
        .build();
    config.into()
}

/// GET an image endpoint. Anything that is not an image is discarded.
pub(crate) fn fetch_image(
    agent: &ureq::Agent,
    url: &str,
    cookie: Option<&str>,
    prefix: &str,
) -> Option<Vec<u8>> {
    let mut req = agent.get(url);
    if let Some(c) = cookie {
        req = req.header("Cookie", c);
    }
    let mut resp = match req.call() {
        Ok(r) => r,
        Err(e) => {
            logger::warn_p(prefix, &format!("capture failed: {}", e));
            return None;
        }
    };
    if resp.status() != 200 {
        logger::warn_p(prefix, &format!("capture returned HTTP {}", resp.status()));
        return None;
    }
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !content_type.contains("image") {
        logger::warn_p(prefix, &format!("capture is not an image ({})", content_type));
        return None;
    }
    match resp.body_mut().read_to_vec() {
        Ok(bytes) if is_image(&bytes) => Some(bytes),
        Ok(bytes) => {
            logger::warn_p(prefix, &format!("capture body is not a known image ({} bytes)", bytes.len()));
            None
        }
        Err(e) => {
            logger::warn_p(prefix, &format!("capture read failed: {}", e));
            None
        }
    }
}
