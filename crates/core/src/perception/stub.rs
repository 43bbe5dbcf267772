use std::sync::{Arc, Mutex};

use super::{Perception, Plan, Verdict};
use crate::action::Action;
use crate::error::PerceptionError;
use crate::logger;

type PlanFn = Box<dyn FnMut(&str) -> Result<Plan, PerceptionError> + Send>;
type VerifyFn = Box<dyn FnMut(&str) -> Result<Verdict, PerceptionError> + Send>;

/// Canned perception for `--stub` runs and tests.
///
/// By default it taps the screen centre and every verification passes.
/// Tests swap in closures to script other replies.
pub struct StubPerception {
    plan: PlanFn,
    verify: VerifyFn,
    answer: String,
    checkpoint: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl StubPerception {
    pub fn new() -> Self {
        Self {
            plan: Box::new(|_| Ok(Plan::Act(Action::tap(0.5, 0.5).with_reasoning("stub")))),
            verify: Box::new(|target| {
                Ok(Verdict { matched: true, state: format!("stub: {}", target), has_more: false })
            }),
            answer: "stub answer".into(),
            checkpoint: true,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn on_plan(mut self, f: impl FnMut(&str) -> Result<Plan, PerceptionError> + Send + 'static) -> Self {
        self.plan = Box::new(f);
        self
    }

    pub fn on_verify(mut self, f: impl FnMut(&str) -> Result<Verdict, PerceptionError> + Send + 'static) -> Self {
        self.verify = Box::new(f);
        self
    }

    pub fn with_answer(mut self, answer: &str) -> Self {
        self.answer = answer.to_string();
        self
    }

    pub fn with_checkpoint(mut self, matched: bool) -> Self {
        self.checkpoint = matched;
        self
    }

    /// Every call as `kind:arg`, in order.
    pub fn calls(&self) -> Arc<Mutex<Vec<String>>> {
        self.calls.clone()
    }

    fn record(&self, kind: &str, arg: &str) {
        logger::info_p("stub", &format!("perception {}({:?})", kind, arg));
        self.calls.lock().unwrap().push(format!("{}:{}", kind, arg));
    }
}

impl Default for StubPerception {
    fn default() -> Self {
        Self::new()
    }
}

impl Perception for StubPerception {
    fn plan(&mut self, _screenshot: &[u8], goal: &str) -> Result<Plan, PerceptionError> {
        self.record("plan", goal);
        (self.plan)(goal)
    }

    fn verify(&mut self, _screenshot: &[u8], target: &str) -> Result<Verdict, PerceptionError> {
        self.record("verify", target);
        (self.verify)(target)
    }

    fn ask(&mut self, _screenshot: &[u8], question: &str) -> Result<String, PerceptionError> {
        self.record("ask", question);
        Ok(self.answer.clone())
    }

    fn checkpoint(&mut self, _screenshot: &[u8], description: &str) -> Result<bool, PerceptionError> {
        self.record("checkpoint", description);
        Ok(self.checkpoint)
    }
}
