use std::sync::Arc;

use crate::action::{Action, Gesture, GuardedAction};
use crate::error::SafetyViolation;
use crate::logger;
use crate::queue::CommandQueue;
use crate::safety::SafetyGuard;
use crate::transform::CoordinateTransform;
use crate::types::{ActuationCommand, CommandOutcome, Motion, RawPoint, Target, WorkArea, DEFAULT_SPEED};

/// Commands for one guarded gesture, all against the same calibration.
pub fn commands_for(action: GuardedAction, area: WorkArea, speed: u32) -> Vec<ActuationCommand> {
    let cmd = |motion| ActuationCommand::new(motion, area);
    match action {
        GuardedAction::Tap(p) => vec![cmd(Motion::Click { at: Target::new(p, &area), speed })],
        GuardedAction::DoubleTap(p) => vec![cmd(Motion::DoubleClick { at: Target::new(p, &area), speed })],
        GuardedAction::LongPress(p, duration_ms) => {
            vec![cmd(Motion::LongPress { at: Target::new(p, &area), speed, duration_ms })]
        }
        GuardedAction::Swipe(a, b) => {
            let from = Target::new(a, &area);
            let to = Target::new(b, &area);
            vec![cmd(Motion::Move { at: from.point }), cmd(Motion::Drag { from, to, speed })]
        }
        GuardedAction::Wait(_) => Vec::new(),
    }
}

/// Every hardware-moving entry point. Actions pass the guard, are mapped
/// with one calibration snapshot and go to the queue as one batch.
#[derive(Clone)]
pub struct Actuator {
    guard: SafetyGuard,
    transform: Arc<CoordinateTransform>,
    queue: CommandQueue,
    speed: u32,
}

impl Actuator {
    pub fn new(guard: SafetyGuard, transform: Arc<CoordinateTransform>, queue: CommandQueue) -> Self {
        Self { guard, transform, queue, speed: DEFAULT_SPEED }
    }

    pub fn with_speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self
    }

    pub fn guard(&self) -> &SafetyGuard {
        &self.guard
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn transform(&self) -> &Arc<CoordinateTransform> {
        &self.transform
    }

    /// Validate then execute. A violation returns before anything is queued.
    pub fn perform(&self, action: &Action) -> Result<Vec<CommandOutcome>, SafetyViolation> {
        let guarded = self.guard.check(action)?;
        Ok(self.apply(guarded))
    }

    /// Execute an already-guarded action. `Wait` produces no commands.
    pub fn apply(&self, action: GuardedAction) -> Vec<CommandOutcome> {
        let commands = commands_for(action, self.transform.snapshot(), self.speed);
        if commands.is_empty() {
            return Vec::new();
        }
        logger::info_p("queue", &format!("gesture {:?} -> {} command(s)", action, commands.len()));
        self.queue.run(&commands)
    }

    pub fn tap(&self, x: f64, y: f64) -> Result<Vec<CommandOutcome>, SafetyViolation> {
        self.perform(&Action::tap(x, y))
    }

    pub fn double_tap(&self, x: f64, y: f64) -> Result<Vec<CommandOutcome>, SafetyViolation> {
        self.perform(&Action::new(Gesture::DoubleTap { at: RawPoint::new(x, y) }))
    }

    pub fn long_press(&self, x: f64, y: f64, duration_ms: Option<u64>) -> Result<Vec<CommandOutcome>, SafetyViolation> {
        self.perform(&Action::new(Gesture::LongPress { at: RawPoint::new(x, y), duration_ms }))
    }

    pub fn swipe(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> Result<Vec<CommandOutcome>, SafetyViolation> {
        self.perform(&Action::swipe(x1, y1, x2, y2))
    }

    /// Send the stylus to its rest position. Not a screen coordinate, so unguarded.
    pub fn reset(&self) -> CommandOutcome {
        let cmd = ActuationCommand::new(Motion::Home, self.transform.snapshot());
        self.queue.run(&[cmd]).pop().unwrap_or(CommandOutcome::Failed("not queued".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DEFAULT_ACK_TIMEOUT;
    use crate::transport::stub::StubTransport;
    use crate::types::{NormalizedPoint, PhysicalPoint};

    fn actuator() -> (Actuator, crate::transport::stub::StubProbe) {
        let stub = StubTransport::new();
        let probe = stub.probe();
        let q = CommandQueue::new(Box::new(stub), DEFAULT_ACK_TIMEOUT);
        let t = Arc::new(CoordinateTransform::new(WorkArea::default()));
        (Actuator::new(SafetyGuard::default(), t, q), probe)
    }

    #[test]
    fn swipe_is_move_then_drag() {
        let a = NormalizedPoint::new(0.5, 0.95).unwrap();
        let b = NormalizedPoint::new(0.5, 0.2).unwrap();
        let cmds = commands_for(GuardedAction::Swipe(a, b), WorkArea::default(), 100);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].motion, Motion::Move { at: PhysicalPoint::new(1950, 5985) });
        let Motion::Drag { from, to, speed } = cmds[1].motion else { panic!("{:?}", cmds[1]) };
        assert_eq!((from.point, to.point, speed), (PhysicalPoint::new(1950, 5985), PhysicalPoint::new(1950, 1260), 100));
        assert_eq!((from.norm, to.norm), (a, b));
    }

    #[test]
    fn centre_tap_reaches_wire() {
        let (act, probe) = actuator();
        let outcomes = act.tap(0.5, 0.5).unwrap();
        assert_eq!(outcomes, vec![CommandOutcome::Acknowledged]);
        assert_eq!(probe.lines(), vec!["move_click, 0, 0, 3900, 6300, 0.50000, 0.50000, 1, 100".to_string()]);
    }

    #[test]
    fn commanded_fraction_reaches_wire_unrounded() {
        let (act, probe) = actuator();
        act.tap(0.12345, 0.54321).unwrap();
        assert_eq!(probe.lines(), vec!["move_click, 0, 0, 3900, 6300, 0.12345, 0.54321, 1, 100".to_string()]);
        assert_eq!(probe.commands()[0].motion.click().unwrap().1.point, PhysicalPoint::new(481, 3422));
    }

    #[test]
    fn violation_never_reaches_transport() {
        let (act, probe) = actuator();
        assert!(act.tap(1.2, 0.5).is_err());
        assert!(act.swipe(0.1, 0.1, 0.1, -0.3).is_err());
        assert!(probe.commands().is_empty());
    }

    #[test]
    fn recalibration_applies_to_next_gesture() {
        let (act, probe) = actuator();
        act.transform().set_work_area(WorkArea::new(1000, 1000, 2000, 2000));
        act.tap(0.5, 0.5).unwrap();
        assert_eq!(probe.commands()[0].motion.click().unwrap().1.point, PhysicalPoint::new(1500, 1500));
        assert_eq!(act.reset(), CommandOutcome::Acknowledged);
        assert_eq!(probe.lines().last().map(String::as_str), Some("home"));
    }
}
