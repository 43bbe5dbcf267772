use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::actuator::Actuator;
use crate::controller::{StepConfig, StepController, StepStats};
use crate::logger;
use crate::perception::{create_perception, Perception};
use crate::queue::CommandQueue;
use crate::safety::SafetyGuard;
use crate::sandbox::{Limits, ScriptOutcome, ScriptSandbox};
use crate::settings::Settings;
use crate::transform::CoordinateTransform;
use crate::transport::{create_transport, Transport};
use crate::types::{CancelToken, WorkArea};

/// Everything needed to drive one device: link, calibration, step loop.
pub struct Session {
    transform: Arc<CoordinateTransform>,
    queue: CommandQueue,
    controller: StepController,
    cancel: CancelToken,
    limits: Limits,
}

impl Session {
    pub fn open(settings: &Settings, force_stub: bool) -> Result<Self> {
        let transport = create_transport(&settings.transport, force_stub).context("opening transport")?;
        let perception = create_perception(&settings.perception, force_stub).context("creating perception client")?;
        Ok(Self::from_parts(transport, perception, settings))
    }

    pub fn from_parts(transport: Box<dyn Transport>, perception: Box<dyn Perception>, settings: &Settings) -> Self {
        let transform = Arc::new(CoordinateTransform::new(settings.calibration));
        let queue = CommandQueue::new(transport, Duration::from_millis(settings.queue.ack_timeout_ms));
        let guard = SafetyGuard::new(settings.safety.z_min, settings.safety.z_max);
        let actuator = Actuator::new(guard, Arc::clone(&transform), queue.clone()).with_speed(settings.queue.speed);
        let cancel = CancelToken::new();
        let config = StepConfig {
            max_attempts: settings.step.max_attempts.max(1),
            settle: Duration::from_millis(settings.step.settle_ms),
        };
        let controller = StepController::new(actuator, perception, config, cancel.clone());
        let limits = Limits {
            max_steps: settings.script.max_steps,
            max_instructions: settings.script.max_instructions,
            max_string_len: settings.script.max_string_len,
        };
        logger::info(&format!("session open on {} transport", queue.transport_name()));
        Self { transform, queue, controller, cancel, limits }
    }

    /// Replace the work area. Returns the area actually applied.
    pub fn calibrate(&self, area: WorkArea) -> WorkArea {
        self.transform.set_work_area(area)
    }

    pub fn work_area(&self) -> WorkArea {
        self.transform.snapshot()
    }

    pub fn controller(&mut self) -> &mut StepController {
        &mut self.controller
    }

    pub fn actuator(&self) -> &Actuator {
        self.controller.actuator()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> StepStats {
        self.controller.stats()
    }

    pub fn run_script(&mut self, src: &str) -> ScriptOutcome {
        self.cancel.reset();
        ScriptSandbox::new(self.limits, self.cancel.clone()).run(&mut self.controller, src)
    }

    /// Park the stylus and log totals.
    pub fn close(self) {
        if self.queue.is_connected() {
            let outcome = self.actuator().reset();
            if !outcome.is_ok() {
                logger::warn(&format!("homing on close: {:?}", outcome));
            }
        }
        let stats = self.controller.stats();
        logger::info(&format!(
            "session closed: {} step(s), {} retries",
            stats.total_steps, stats.total_retries
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::stub::StubPerception;
    use crate::perception::Verdict;
    use crate::transport::stub::StubTransport;
    use crate::types::Motion;

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.step.settle_ms = 0;
        s
    }

    #[test]
    fn script_drives_the_stub_device() {
        let transport = StubTransport::new();
        let probe = transport.probe();
        let mut session = Session::from_parts(Box::new(transport), Box::new(StubPerception::new()), &settings());

        let out = session.run_script("let r = step('open mail')\nlog(r.state)");
        assert!(out.success, "{out:?}");
        assert_eq!(out.output, vec!["stub: open mail".to_string()]);
        assert_eq!(probe.lines(), vec!["move_click, 0, 0, 3900, 6300, 0.50000, 0.50000, 1, 100".to_string()]);
        assert_eq!(session.stats().total_steps, 1);

        session.close();
        assert!(matches!(probe.commands().last().map(|c| &c.motion), Some(Motion::Home)));
    }

    #[test]
    fn calibration_applies_to_later_steps() {
        let transport = StubTransport::new();
        let probe = transport.probe();
        let mut session = Session::from_parts(Box::new(transport), Box::new(StubPerception::new()), &settings());

        assert_eq!(session.calibrate(WorkArea::new(100, 100, 150, 1100)), WorkArea::new(100, 100, 200, 1100));
        assert_eq!(session.work_area(), WorkArea::new(100, 100, 200, 1100));
        session.controller().step("tap centre", None).unwrap();
        assert_eq!(probe.lines()[0], "move_click, 100, 100, 200, 1100, 0.50000, 0.50000, 1, 100");
    }

    #[test]
    fn configured_speed_reaches_the_device() {
        let transport = StubTransport::new();
        let probe = transport.probe();
        let mut s = settings();
        s.queue.speed = 40;
        let mut session = Session::from_parts(Box::new(transport), Box::new(StubPerception::new()), &s);
        session.controller().step("tap centre", None).unwrap();
        assert_eq!(probe.lines()[0], "move_click, 0, 0, 3900, 6300, 0.50000, 0.50000, 1, 40");
    }

    #[test]
    fn failing_verification_reports_max_retries() {
        let perception = StubPerception::new()
            .on_verify(|_| Ok(Verdict { matched: false, state: "nothing changed".into(), has_more: false }));
        let mut session = Session::from_parts(Box::new(StubTransport::new()), Box::new(perception), &settings());
        let out = session.run_script("step('open settings')");
        assert!(!out.success);
        assert_eq!(out.error_kind.as_deref(), Some("max_retries"));
        assert_eq!(out.retries, 1);
    }

    #[test]
    fn open_with_stub_flag() {
        let session = Session::open(&Settings::default(), true).unwrap();
        assert_eq!(session.queue().transport_name(), "stub");
    }
}
