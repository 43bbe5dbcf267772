pub mod http;
pub mod stub;

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::action::{Action, Gesture};
use crate::error::PerceptionError;
use crate::logger;
use crate::settings::PerceptionSettings;
use crate::types::RawPoint;

/// What the planner wants done next.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Act(Action),
    /// Automation cannot continue; a human has to step in.
    TakeOver(String),
    /// The goal is already reached.
    Finished,
}

/// Verifier judgement on a fresh screenshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Verdict {
    pub matched: bool,
    pub state: String,
    pub has_more: bool,
}

/// The external vision model, in both planner and verifier roles.
pub trait Perception: Send {
    fn plan(&mut self, screenshot: &[u8], goal: &str) -> Result<Plan, PerceptionError>;
    fn verify(&mut self, screenshot: &[u8], target: &str) -> Result<Verdict, PerceptionError>;
    fn ask(&mut self, screenshot: &[u8], question: &str) -> Result<String, PerceptionError>;
    fn checkpoint(&mut self, screenshot: &[u8], description: &str) -> Result<bool, PerceptionError>;
}

/// Create the perception client for `settings`.
pub fn create_perception(
    settings: &PerceptionSettings,
    force_stub: bool,
) -> Result<Box<dyn Perception>, PerceptionError> {
    if force_stub {
        return Ok(Box::new(stub::StubPerception::new()));
    }
    match settings.base_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            logger::info_p("perception", &format!("using service at {}", url));
            Ok(Box::new(http::HttpPerception::new(url, settings.timeout_secs)))
        }
        _ => Err(PerceptionError::Http("no perception base_url configured".into())),
    }
}

const NUM: &str = r"\s*(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)\s*";

struct Patterns {
    double_tap: Regex,
    long_press: Regex,
    swipe: Regex,
    tap: Regex,
    wait: Regex,
    take_over: Regex,
    finished: Regex,
    back: Regex,
    home: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |s: String| Regex::new(&format!("(?i){}", s)).unwrap();
        Patterns {
            double_tap: re(format!(r"double[\s_]*tap\s*\({NUM},{NUM}\)")),
            long_press: re(format!(r"long[\s_]*press\s*\({NUM},{NUM}(?:,{NUM})?\)")),
            swipe: re(format!(r"swipe\s*\({NUM},{NUM},{NUM},{NUM}\)")),
            tap: re(format!(r"\btap\s*\({NUM},{NUM}\)")),
            wait: re(format!(r"\bwait\s*\({NUM}\)")),
            take_over: re(r"take[\s_]*over".into()),
            finished: re(r"task[\s_]*finished".into()),
            back: re(r"^back\s*(?:\(\s*\))?$".into()),
            home: re(r"^home\s*(?:\(\s*\))?$".into()),
        }
    })
}

fn num(c: &Captures, i: usize) -> Result<f64, PerceptionError> {
    let s = c.get(i).map(|m| m.as_str()).unwrap_or("");
    s.parse::<f64>()
        .map_err(|_| PerceptionError::Malformed(format!("bad number {:?}", s)))
}

fn point(c: &Captures, i: usize) -> Result<RawPoint, PerceptionError> {
    Ok(RawPoint::new(num(c, i)?, num(c, i + 1)?))
}

/// Parse a planner reply such as `Tap(0.5, 0.3) | open settings`.
///
/// Coordinates are kept as written; range checking belongs to the guard.
pub fn parse_plan(text: &str) -> Result<Plan, PerceptionError> {
    let (command, reasoning) = match text.split_once('|') {
        Some((c, r)) => (c.trim(), r.trim()),
        None => (text.trim(), ""),
    };
    let p = patterns();
    let act = |g: Gesture| Ok(Plan::Act(Action::new(g).with_reasoning(reasoning)));

    // Terminal signals win over any gesture in the same reply.
    if p.take_over.is_match(command) {
        let reason = if reasoning.is_empty() { command } else { reasoning };
        return Ok(Plan::TakeOver(reason.to_string()));
    }
    if p.finished.is_match(command) {
        return Ok(Plan::Finished);
    }

    if let Some(c) = p.double_tap.captures(command) {
        return act(Gesture::DoubleTap { at: point(&c, 1)? });
    }
    if let Some(c) = p.long_press.captures(command) {
        let duration_ms = match c.get(3) {
            Some(_) => Some(num(&c, 3)?.max(0.0) as u64),
            None => None,
        };
        return act(Gesture::LongPress { at: point(&c, 1)?, duration_ms });
    }
    if let Some(c) = p.swipe.captures(command) {
        return act(Gesture::Swipe { from: point(&c, 1)?, to: point(&c, 3)? });
    }
    if let Some(c) = p.tap.captures(command) {
        return act(Gesture::Tap { at: point(&c, 1)? });
    }
    if let Some(c) = p.wait.captures(command) {
        return act(Gesture::Wait { secs: num(&c, 1)? });
    }
    if p.back.is_match(command) {
        return act(Gesture::Back);
    }
    if p.home.is_match(command) {
        return act(Gesture::Home);
    }
    Err(PerceptionError::NoAction(text.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gesture(text: &str) -> Gesture {
        match parse_plan(text).unwrap() {
            Plan::Act(a) => a.gesture,
            other => panic!("{text}: {other:?}"),
        }
    }

    #[test]
    fn gestures() {
        assert_eq!(gesture("Tap(0.5, 0.3)"), Gesture::Tap { at: RawPoint::new(0.5, 0.3) });
        assert_eq!(gesture("doubletap(0.1,0.2)"), Gesture::DoubleTap { at: RawPoint::new(0.1, 0.2) });
        assert_eq!(gesture("Double Tap(0.1, 0.2)"), Gesture::DoubleTap { at: RawPoint::new(0.1, 0.2) });
        assert_eq!(
            gesture("LongPress(0.4, 0.6)"),
            Gesture::LongPress { at: RawPoint::new(0.4, 0.6), duration_ms: None }
        );
        assert_eq!(
            gesture("long_press(0.4, 0.6, 1500)"),
            Gesture::LongPress { at: RawPoint::new(0.4, 0.6), duration_ms: Some(1500) }
        );
        assert_eq!(
            gesture("SWIPE(0.5, 0.9, 0.5, 0.1)"),
            Gesture::Swipe { from: RawPoint::new(0.5, 0.9), to: RawPoint::new(0.5, 0.1) }
        );
        assert_eq!(gesture("Wait(1.5)"), Gesture::Wait { secs: 1.5 });
        assert_eq!(gesture("Back"), Gesture::Back);
        assert_eq!(gesture("home"), Gesture::Home);
    }

    #[test]
    fn out_of_range_values_are_kept() {
        assert_eq!(gesture("Tap(1.5, -0.2)"), Gesture::Tap { at: RawPoint::new(1.5, -0.2) });
    }

    #[test]
    fn reasoning_suffix() {
        match parse_plan("Tap(0.2, 0.8) | the Settings icon").unwrap() {
            Plan::Act(a) => assert_eq!(a.reasoning, "the Settings icon"),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn terminal_replies() {
        assert_eq!(parse_plan("TaskFinished").unwrap(), Plan::Finished);
        assert_eq!(
            parse_plan("TakeOver | captcha on screen").unwrap(),
            Plan::TakeOver("captcha on screen".into())
        );
    }

    #[test]
    fn take_over_beats_gestures() {
        assert_eq!(
            parse_plan("Tap(0.5, 0.5) then Take_over").unwrap(),
            Plan::TakeOver("Tap(0.5, 0.5) then Take_over".into())
        );
        assert_eq!(parse_plan("Swipe(0.5, 0.9, 0.5, 0.1); task_finished").unwrap(), Plan::Finished);
    }

    #[test]
    fn prose_is_not_a_command() {
        for text in ["The task is not finished yet", "go back to the list", "the home screen is visible"] {
            assert!(matches!(parse_plan(text), Err(PerceptionError::NoAction(_))), "{text}");
        }
        assert_eq!(gesture("Back()"), Gesture::Back);
    }

    #[test]
    fn unparseable_is_no_action() {
        assert!(matches!(parse_plan("I am not sure"), Err(PerceptionError::NoAction(_))));
        assert!(matches!(parse_plan("Tap(x, y)"), Err(PerceptionError::NoAction(_))));
        assert!(matches!(parse_plan(""), Err(PerceptionError::NoAction(_))));
    }

    #[test]
    fn stub_factory() {
        let settings = PerceptionSettings::default();
        assert!(create_perception(&settings, true).is_ok());
        assert!(create_perception(&settings, false).is_err());
    }
}
