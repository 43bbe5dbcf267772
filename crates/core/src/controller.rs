//! Closed-loop step execution.
//!
//! One `step()` runs capture, plan, guard, act, settle and verify, retrying
//! on soft failures up to the attempt budget. Safety violations, take-over
//! requests and cancellation abort immediately and are never retried.

use std::fmt;
use std::time::Duration;

use crate::action::GuardedAction;
use crate::actuator::Actuator;
use crate::error::StepError;
use crate::logger;
use crate::perception::{Perception, Plan};
use crate::sleep::sleep_cancellable;
use crate::types::{CancelToken, CommandOutcome, StepResult};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepConfig {
    /// Total attempts per step, first try included.
    pub max_attempts: u32,
    pub settle: Duration,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self { max_attempts: 2, settle: Duration::from_millis(2000) }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub total_steps: u64,
    pub total_retries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Capturing,
    Planning,
    Guarding,
    Acting,
    Settling,
    Verifying,
    Retrying,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Capturing => "capturing",
            Phase::Planning => "planning",
            Phase::Guarding => "guarding",
            Phase::Acting => "acting",
            Phase::Settling => "settling",
            Phase::Verifying => "verifying",
            Phase::Retrying => "retrying",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}

pub struct StepController {
    actuator: Actuator,
    perception: Box<dyn Perception>,
    config: StepConfig,
    cancel: CancelToken,
    stats: StepStats,
}

impl StepController {
    pub fn new(actuator: Actuator, perception: Box<dyn Perception>, config: StepConfig, cancel: CancelToken) -> Self {
        Self { actuator, perception, config, cancel, stats: StepStats::default() }
    }

    pub fn stats(&self) -> StepStats {
        self.stats
    }

    pub fn config(&self) -> StepConfig {
        self.config
    }

    pub fn actuator(&self) -> &Actuator {
        &self.actuator
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn enter(&self, phase: Phase, attempt: u32) {
        logger::info_p("step", &format!("[{}/{}] {}", attempt + 1, self.config.max_attempts, phase));
    }

    fn check_cancel(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            logger::warn_p("step", "cancelled");
            return Err(StepError::Cancelled);
        }
        Ok(())
    }

    fn capture(&self) -> Option<Vec<u8>> {
        self.actuator.queue().screenshot()
    }

    /// Reach `goal`, confirmed against `expect` (or the goal itself).
    ///
    /// Soft failures come back as `Ok(StepResult { success: false, .. })`
    /// once the attempt budget is spent.
    pub fn step(&mut self, goal: &str, expect: Option<&str>) -> Result<StepResult, StepError> {
        self.stats.total_steps += 1;
        let target = expect.unwrap_or(goal);
        let attempts = self.config.max_attempts.max(1);
        logger::info_p("step", &format!("goal: {}", goal));

        let mut retries = 0;
        let mut last_error = String::new();
        let mut last_state = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                retries += 1;
                self.stats.total_retries += 1;
                self.enter(Phase::Retrying, attempt);
                logger::warn_p("step", &format!("retrying after: {}", last_error));
            }
            self.check_cancel()?;

            self.enter(Phase::Capturing, attempt);
            let Some(shot) = self.capture() else {
                last_error = "screenshot unavailable".into();
                continue;
            };
            self.check_cancel()?;

            self.enter(Phase::Planning, attempt);
            let action = match self.perception.plan(&shot, goal) {
                Ok(Plan::Act(a)) => a,
                Ok(Plan::Finished) => {
                    self.enter(Phase::Done, attempt);
                    return Ok(StepResult {
                        success: true,
                        state: "task finished".into(),
                        has_more: false,
                        error: None,
                        retries,
                    });
                }
                Ok(Plan::TakeOver(reason)) => {
                    logger::error_p("step", &format!("take-over requested: {}", reason));
                    return Err(StepError::TakeOver(reason));
                }
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };

            self.enter(Phase::Guarding, attempt);
            let guarded = self.actuator.guard().check(&action).map_err(|v| {
                logger::error_p("step", &format!("safety violation: {}", v));
                StepError::Safety(v)
            })?;
            self.check_cancel()?;

            self.enter(Phase::Acting, attempt);
            if !action.reasoning.is_empty() {
                logger::info_p("step", &format!("{:?} ({})", guarded, action.reasoning));
            }
            match guarded {
                GuardedAction::Wait(d) => {
                    if !sleep_cancellable(d, &self.cancel) {
                        return Err(StepError::Cancelled);
                    }
                }
                _ => {
                    let outcomes = self.actuator.apply(guarded);
                    if let Some(why) = outcomes.iter().find_map(|o| match o {
                        CommandOutcome::Failed(why) => Some(why.clone()),
                        _ => None,
                    }) {
                        last_error = format!("actuation failed: {}", why);
                        continue;
                    }
                    if outcomes.contains(&CommandOutcome::TimedOut) {
                        logger::warn_p("step", "actuation not acknowledged, verifying anyway");
                    }
                }
            }
            self.check_cancel()?;

            self.enter(Phase::Settling, attempt);
            if !sleep_cancellable(self.config.settle, &self.cancel) {
                return Err(StepError::Cancelled);
            }

            self.enter(Phase::Verifying, attempt);
            let Some(shot) = self.capture() else {
                last_error = "screenshot unavailable for verification".into();
                continue;
            };
            match self.perception.verify(&shot, target) {
                Ok(v) if v.matched => {
                    self.enter(Phase::Done, attempt);
                    return Ok(StepResult {
                        success: true,
                        state: v.state,
                        has_more: v.has_more,
                        error: None,
                        retries,
                    });
                }
                Ok(v) => {
                    last_error = format!("verification failed: {}", v.state);
                    last_state = v.state;
                }
                Err(e) => last_error = e.to_string(),
            }
        }

        logger::error_p("step", &format!("gave up on '{}' after {} attempt(s): {}", goal, attempts, last_error));
        Ok(StepResult {
            success: false,
            state: last_state,
            has_more: false,
            error: Some(format!("max retries: {}", last_error)),
            retries,
        })
    }

    /// Read-only query about the current screen. Never actuates.
    pub fn ask(&mut self, question: &str) -> Result<String, StepError> {
        self.query("ask", |p, shot| p.ask(shot, question))
    }

    /// Judge whether the screen shows `description`. Never actuates.
    pub fn checkpoint(&mut self, description: &str) -> Result<bool, StepError> {
        self.query("checkpoint", |p, shot| p.checkpoint(shot, description))
    }

    fn query<T>(
        &mut self,
        kind: &str,
        mut f: impl FnMut(&mut dyn Perception, &[u8]) -> Result<T, crate::error::PerceptionError>,
    ) -> Result<T, StepError> {
        let mut last_error = String::new();
        for attempt in 0..self.config.max_attempts.max(1) {
            self.check_cancel()?;
            if attempt > 0 {
                logger::warn_p("step", &format!("{} retry after: {}", kind, last_error));
            }
            let Some(shot) = self.capture() else {
                last_error = "screenshot unavailable".into();
                continue;
            };
            match f(self.perception.as_mut(), &shot) {
                Ok(v) => return Ok(v),
                Err(e) => last_error = e.to_string(),
            }
        }
        Err(StepError::Query(format!("{}: {}", kind, last_error)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::error::{Axis, PerceptionError};
    use crate::perception::stub::StubPerception;
    use crate::perception::Verdict;
    use crate::queue::{CommandQueue, DEFAULT_ACK_TIMEOUT};
    use crate::safety::SafetyGuard;
    use crate::transform::CoordinateTransform;
    use crate::transport::stub::{StubProbe, StubTransport};
    use crate::types::WorkArea;
    use std::sync::Arc;
    use std::thread;

    fn controller_with(stub: StubTransport, perception: StubPerception, attempts: u32) -> (StepController, StubProbe) {
        let probe = stub.probe();
        let queue = CommandQueue::new(Box::new(stub), DEFAULT_ACK_TIMEOUT);
        let transform = Arc::new(CoordinateTransform::new(WorkArea::default()));
        let actuator = Actuator::new(SafetyGuard::default(), transform, queue);
        let config = StepConfig { max_attempts: attempts, settle: Duration::from_millis(1) };
        (StepController::new(actuator, Box::new(perception), config, CancelToken::new()), probe)
    }

    fn controller(perception: StubPerception, attempts: u32) -> (StepController, StubProbe) {
        controller_with(StubTransport::new(), perception, attempts)
    }

    #[test]
    fn centre_tap_end_to_end() {
        let (mut c, probe) = controller(StubPerception::new(), 2);
        let r = c.step("open the app", None).unwrap();
        assert!(r.success);
        assert_eq!(r.retries, 0);
        let cmds = probe.commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].motion.click().unwrap().1.point, crate::types::PhysicalPoint::new(1950, 3150));
        assert_eq!(c.stats(), StepStats { total_steps: 1, total_retries: 0 });
    }

    #[test]
    fn no_action_exhausts_budget() {
        let p = StubPerception::new().on_plan(|_| Err(PerceptionError::NoAction("?".into())));
        let (mut c, probe) = controller(p, 3);
        let r = c.step("find the thing", None).unwrap();
        assert!(!r.success);
        assert_eq!(r.retries, 2);
        assert!(r.error.unwrap().starts_with("max retries"));
        assert!(probe.commands().is_empty());
        assert_eq!(c.stats().total_retries, 2);
    }

    #[test]
    fn safety_violation_raises_without_retry() {
        let p = StubPerception::new().on_plan(|_| Ok(Plan::Act(Action::tap(1.7, 0.5))));
        let calls = p.calls();
        let (mut c, probe) = controller(p, 3);
        match c.step("tap outside", None) {
            Err(StepError::Safety(v)) => assert_eq!(v.axis, Axis::X),
            other => panic!("{other:?}"),
        }
        assert!(probe.commands().is_empty());
        assert_eq!(c.stats().total_retries, 0);
        assert_eq!(calls.lock().unwrap().iter().filter(|s| s.starts_with("plan:")).count(), 1);
    }

    #[test]
    fn take_over_is_fatal() {
        let p = StubPerception::new().on_plan(|_| Ok(Plan::TakeOver("captcha".into())));
        let (mut c, probe) = controller(p, 3);
        assert!(matches!(c.step("log in", None), Err(StepError::TakeOver(r)) if r == "captcha"));
        assert!(probe.commands().is_empty());
    }

    #[test]
    fn failed_verification_retries_then_succeeds() {
        let mut n = 0;
        let p = StubPerception::new().on_verify(move |_| {
            n += 1;
            Ok(Verdict { matched: n > 1, state: format!("check {}", n), has_more: true })
        });
        let (mut c, probe) = controller(p, 2);
        let r = c.step("scroll", Some("list moved")).unwrap();
        assert!(r.success && r.has_more);
        assert_eq!(r.retries, 1);
        assert_eq!(r.state, "check 2");
        assert_eq!(probe.commands().len(), 2);
    }

    #[test]
    fn expect_is_the_verification_target() {
        let p = StubPerception::new();
        let calls = p.calls();
        let (mut c, _) = controller(p, 1);
        c.step("tap compose", Some("editor open")).unwrap();
        assert!(calls.lock().unwrap().contains(&"verify:editor open".to_string()));
    }

    #[test]
    fn missing_screenshot_is_retried() {
        let (mut c, probe) = controller_with(StubTransport::new().with_screen(None), StubPerception::new(), 2);
        let r = c.step("anything", None).unwrap();
        assert!(!r.success);
        assert_eq!(r.retries, 1);
        assert!(probe.commands().is_empty());
        assert!(matches!(c.ask("what?"), Err(StepError::Query(_))));
    }

    #[test]
    fn transport_failure_is_retried() {
        let stub = StubTransport::new();
        stub.probe().disconnect();
        let (mut c, _) = controller_with(stub, StubPerception::new(), 2);
        let r = c.step("tap", None).unwrap();
        assert!(!r.success);
        assert!(r.error.unwrap().contains("disconnected"));
    }

    #[test]
    fn finished_and_wait_do_not_move() {
        let p = StubPerception::new().on_plan(|g| {
            Ok(if g == "done?" { Plan::Finished } else { Plan::Act(Action::new(crate::action::Gesture::Wait { secs: 0.01 })) })
        });
        let (mut c, probe) = controller(p, 1);
        assert!(c.step("done?", None).unwrap().success);
        assert!(c.step("let it load", None).unwrap().success);
        assert!(probe.commands().is_empty());
    }

    #[test]
    fn ask_and_checkpoint_never_actuate() {
        let p = StubPerception::new().with_answer("3 unread").with_checkpoint(false);
        let (mut c, probe) = controller(p, 2);
        assert_eq!(c.ask("how many unread?").unwrap(), "3 unread");
        assert!(!c.checkpoint("inbox empty").unwrap());
        assert!(probe.commands().is_empty());
        assert!(probe.screenshots_taken() >= 2);
    }

    #[test]
    fn cancel_during_settle() {
        let (c, _) = controller(StubPerception::new(), 2);
        let mut c = StepController { config: StepConfig { max_attempts: 2, settle: Duration::from_secs(30) }, ..c };
        let token = c.cancel_token();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });
        assert!(matches!(c.step("slow", None), Err(StepError::Cancelled)));
        h.join().unwrap();
        assert!(matches!(c.step("again", None), Err(StepError::Cancelled)));
    }
}
