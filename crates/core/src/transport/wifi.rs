use std::time::Duration;

use super::{fetch_image, http_agent, Dispatch, Transport};
use crate::error::TransportError;
use crate::logger;
use crate::sleep::sleep_ms;
use crate::transform::to_normalized;
use crate::types::{ActuationCommand, Motion, NormalizedPoint};

pub const DEFAULT_PORT: u16 = 8888;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_COOKIE: &str = "ESPSESSIONID";
const DRAG_STEPS: u32 = 10;
const DRAG_STEP_DELAY_MS: u64 = 50;
const DOUBLE_TAP_GAP_MS: u64 = 100;

/// Pull `ESPSESSIONID=<v>` out of one Set-Cookie header.
fn session_cookie(header: &str) -> Option<String> {
    let pair = header.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    (name.trim() == SESSION_COOKIE && !value.trim().is_empty()).then(|| pair.to_string())
}

/// HTTP-controlled stylus on the local network. Every motion is a
/// blocking request, so commands complete inside `execute`.
pub struct WifiTransport {
    base_url: String,
    agent: ureq::Agent,
    cookie: Option<String>,
    connected: bool,
}

impl WifiTransport {
    /// Log in at `base_url` (e.g. `http://192.168.4.1:8888`).
    pub fn connect(base_url: &str, username: &str, password: &str) -> Result<Self, TransportError> {
        let mut t = Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: http_agent(HTTP_TIMEOUT),
            cookie: None,
            connected: false,
        };
        t.login(username, password)?;
        Ok(t)
    }

    fn login(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        logger::info_p("wifi", &format!("login at {}", self.base_url));
        let resp = self
            .agent
            .post(&format!("{}/login", self.base_url))
            .send_form([("username", username), ("password", password)])?;

        let status = resp.status().as_u16();
        if status != 200 && status != 302 {
            return Err(TransportError::LoginFailed(format!("HTTP {}", status)));
        }
        let cookie = resp
            .headers()
            .get_all("set-cookie")
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(session_cookie)
            .ok_or_else(|| TransportError::LoginFailed("no session cookie in reply".into()))?;

        logger::info_p("wifi", "session established");
        self.cookie = Some(cookie);
        self.connected = true;
        Ok(())
    }

    fn move_to(&mut self, p: NormalizedPoint) -> Result<(), TransportError> {
        let mut req = self
            .agent
            .get(&format!("{}/test_move", self.base_url))
            .query("x", format!("{:.5}", p.x()))
            .query("y", format!("{:.5}", p.y()));
        if let Some(c) = &self.cookie {
            req = req.header("Cookie", c);
        }
        let resp = match req.call() {
            Ok(r) => r,
            Err(e) => {
                logger::error_p("wifi", &format!("request failed, link down: {}", e));
                self.connected = false;
                return Err(e.into());
            }
        };
        match resp.status().as_u16() {
            200 => Ok(()),
            status @ (401 | 403) => {
                logger::error_p("wifi", &format!("session rejected (HTTP {})", status));
                self.connected = false;
                Err(TransportError::Rejected { status })
            }
            status => Err(TransportError::Rejected { status }),
        }
    }

    fn drag(&mut self, from: NormalizedPoint, to: NormalizedPoint) -> Result<(), TransportError> {
        for i in 0..=DRAG_STEPS {
            let t = i as f64 / DRAG_STEPS as f64;
            let p = NormalizedPoint::clamped(
                from.x() + (to.x() - from.x()) * t,
                from.y() + (to.y() - from.y()) * t,
            );
            self.move_to(p)?;
            if i < DRAG_STEPS {
                sleep_ms(DRAG_STEP_DELAY_MS);
            }
        }
        Ok(())
    }
}

impl Transport for WifiTransport {
    fn name(&self) -> &str {
        "wifi"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn execute(&mut self, cmd: &ActuationCommand) -> Result<Dispatch, TransportError> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        let area = &cmd.area;
        logger::info_p("wifi", &format!("{} {:?}", cmd.motion.name(), cmd.motion));
        match cmd.motion {
            Motion::Move { at } => self.move_to(to_normalized(at, area))?,
            Motion::Click { at, .. } => self.move_to(at.norm)?,
            Motion::DoubleClick { at, .. } => {
                let p = at.norm;
                self.move_to(p)?;
                sleep_ms(DOUBLE_TAP_GAP_MS);
                self.move_to(p)?;
            }
            Motion::LongPress { at, duration_ms, .. } => {
                self.move_to(at.norm)?;
                sleep_ms(duration_ms);
            }
            Motion::Drag { from, to, .. } => self.drag(from.norm, to.norm)?,
            Motion::Home => self.move_to(NormalizedPoint::clamped(0.0, 0.0))?,
        }
        Ok(Dispatch::Completed)
    }

    fn screenshot(&mut self) -> Option<Vec<u8>> {
        if !self.connected {
            return None;
        }
        let url = format!("{}/capture", self.base_url);
        fetch_image(&self.agent, &url, self.cookie.as_deref(), "wifi")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake_http::{serve, Reply, Request};
    use crate::transport::stub::STUB_PNG;
    use crate::types::{PhysicalPoint, Target, WorkArea};

    fn device(req: &Request) -> Reply {
        let path = req.target.split('?').next().unwrap_or("");
        match path {
            "/login" => {
                let body = String::from_utf8_lossy(&req.body);
                if body.contains("username=admin") && body.contains("password=admin") {
                    Reply::status(302).with_header("Set-Cookie", "ESPSESSIONID=abc123; Path=/")
                } else {
                    Reply::status(401)
                }
            }
            _ if req.header("cookie") != Some("ESPSESSIONID=abc123") => Reply::status(401),
            "/test_move" => Reply::ok("text/plain", "ok"),
            "/capture" => Reply::ok("image/png", STUB_PNG.to_vec()),
            _ => Reply::status(404),
        }
    }

    fn moves(reqs: &[Request]) -> Vec<String> {
        reqs.iter()
            .filter(|r| r.target.starts_with("/test_move"))
            .map(|r| r.target.clone())
            .collect()
    }

    #[test]
    fn cookie_parsing() {
        assert_eq!(session_cookie("ESPSESSIONID=42; Path=/"), Some("ESPSESSIONID=42".into()));
        assert_eq!(session_cookie("other=1"), None);
        assert_eq!(session_cookie("ESPSESSIONID=; Path=/"), None);
    }

    #[test]
    fn login_then_tap_sends_normalized_query() {
        let server = serve(device);
        let mut t = WifiTransport::connect(&server.base_url, "admin", "admin").unwrap();
        assert!(t.is_connected());

        let area = WorkArea::default();
        let cmd = ActuationCommand::new(
            Motion::Click { at: Target::from_point(PhysicalPoint::new(1950, 3150), &area), speed: 100 },
            area,
        );
        assert_eq!(t.execute(&cmd).unwrap(), Dispatch::Completed);
        let exact = NormalizedPoint::new(0.12345, 0.54321).unwrap();
        let cmd = ActuationCommand::new(Motion::Click { at: Target::new(exact, &area), speed: 100 }, area);
        t.execute(&cmd).unwrap();

        let reqs = server.requests.lock().unwrap();
        assert_eq!(reqs[0].method, "POST");
        assert_eq!(moves(&reqs), vec![
            "/test_move?x=0.50000&y=0.50000".to_string(),
            "/test_move?x=0.12345&y=0.54321".to_string(),
        ]);
    }

    #[test]
    fn bad_credentials_fail_login() {
        let server = serve(device);
        let err = WifiTransport::connect(&server.base_url, "admin", "nope").err().unwrap();
        assert!(matches!(err, TransportError::LoginFailed(_)), "{err}");
    }

    #[test]
    fn drag_interpolates_and_home_goes_to_origin() {
        let server = serve(device);
        let mut t = WifiTransport::connect(&server.base_url, "admin", "admin").unwrap();
        let area = WorkArea::default();
        let drag = Motion::Drag {
            from: Target::from_point(PhysicalPoint::new(0, 0), &area),
            to: Target::from_point(PhysicalPoint::new(3900, 0), &area),
            speed: 100,
        };
        t.execute(&ActuationCommand::new(drag, area)).unwrap();
        t.execute(&ActuationCommand::new(Motion::Home, area)).unwrap();

        let m = moves(&server.requests.lock().unwrap());
        assert_eq!(m.len(), DRAG_STEPS as usize + 2);
        assert_eq!(m[0], "/test_move?x=0.00000&y=0.00000");
        assert_eq!(m[5], "/test_move?x=0.50000&y=0.00000");
        assert_eq!(m[10], "/test_move?x=1.00000&y=0.00000");
        assert_eq!(m[11], "/test_move?x=0.00000&y=0.00000");
    }

    #[test]
    fn capture_uses_session() {
        let server = serve(device);
        let mut t = WifiTransport::connect(&server.base_url, "admin", "admin").unwrap();
        assert_eq!(t.screenshot().as_deref(), Some(STUB_PNG));
    }

    #[test]
    fn rejected_session_marks_disconnected() {
        let server = serve(|req: &Request| {
            if req.target.starts_with("/login") {
                Reply::status(200).with_header("Set-Cookie", "ESPSESSIONID=zzz")
            } else {
                Reply::status(401)
            }
        });
        let mut t = WifiTransport::connect(&server.base_url, "admin", "admin").unwrap();
        let cmd = ActuationCommand::new(Motion::Home, WorkArea::default());
        assert!(matches!(t.execute(&cmd), Err(TransportError::Rejected { status: 401 })));
        assert!(!t.is_connected());
        assert!(matches!(t.execute(&cmd), Err(TransportError::Disconnected)));
        assert!(t.screenshot().is_none());
    }
}
