//! Restricted execution of multi-step plan scripts.
//!
//! Scripts are parsed into an AST and walked by a small interpreter whose
//! only side-effecting calls are `step`, `ask`, `checkpoint` and `log`.
//! There is no file, process or network access to expose.

pub mod ast;
pub mod interp;
pub mod parser;

use serde::Serialize;

use crate::controller::StepController;
use crate::error::{ScriptError, StepError};
use crate::logger;
use crate::types::{CancelToken, StepResult};

pub use interp::{Host, Limits, StepLog, Value};

impl Host for StepController {
    fn step(&mut self, goal: &str, expect: Option<&str>) -> Result<StepResult, StepError> {
        StepController::step(self, goal, expect)
    }

    fn ask(&mut self, question: &str) -> Result<String, StepError> {
        StepController::ask(self, question)
    }

    fn checkpoint(&mut self, description: &str) -> Result<bool, StepError> {
        StepController::checkpoint(self, description)
    }
}

/// Structured result of one script run; scripts never surface a raw error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScriptOutcome {
    pub success: bool,
    /// Short tag such as `safety` or `max_retries`
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub steps: usize,
    pub retries: u32,
    pub step_log: Vec<StepLog>,
    pub output: Vec<String>,
}

pub struct ScriptSandbox {
    limits: Limits,
    cancel: CancelToken,
}

impl ScriptSandbox {
    pub fn new(limits: Limits, cancel: CancelToken) -> Self {
        Self { limits, cancel }
    }

    /// Parse and run `src` against `host`. Aborts at the first fatal error,
    /// keeping the counters accumulated up to that point.
    pub fn run<H: Host>(&self, host: &mut H, src: &str) -> ScriptOutcome {
        let program = match parser::parse_script(src) {
            Ok(p) => p,
            Err(e) => return failed(e, Vec::new(), Vec::new()),
        };
        logger::info_p("script", &format!("running {} statement(s)", program.len()));

        let mut interp = interp::Interpreter::new(host, self.limits, self.cancel.clone());
        let result = interp.run(&program);
        let steps = std::mem::take(&mut interp.steps);
        let output = std::mem::take(&mut interp.output);

        match result {
            Ok(()) => {
                let retries = steps.iter().map(|s| s.retries).sum();
                logger::info_p("script", &format!("finished: {} step(s), {} retries", steps.len(), retries));
                ScriptOutcome {
                    success: true,
                    error_kind: None,
                    error: None,
                    steps: steps.len(),
                    retries,
                    step_log: steps,
                    output,
                }
            }
            Err(e) => failed(e, steps, output),
        }
    }
}

fn failed(e: ScriptError, steps: Vec<StepLog>, output: Vec<String>) -> ScriptOutcome {
    logger::error_p("script", &format!("aborted ({}): {}", e.kind(), e));
    ScriptOutcome {
        success: false,
        error_kind: Some(e.kind().to_string()),
        error: Some(e.to_string()),
        steps: steps.len(),
        retries: steps.iter().map(|s| s.retries).sum(),
        step_log: steps,
        output,
    }
}
