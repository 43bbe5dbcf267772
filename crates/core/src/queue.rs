//! Serialized access to the actuation transport.
//!
//! Commands run strictly in FIFO order and at most one is `Executing` at any
//! time. There is no dedicated worker thread: the caller that enqueues into an
//! idle queue becomes the executor and drains it, later callers only append
//! and wait on their ticket. A missing acknowledgment times out, the command
//! is dropped and the queue moves on.
//!
//! The executor's own call therefore returns only once the queue is empty
//! again, which includes commands other callers appended while it was
//! draining. Its latency is bounded by queue depth times the ack timeout,
//! not by its own commands alone, and a cancellation it observes takes
//! effect after that return.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, TryLockError};
use std::time::{Duration, Instant};

use crate::logger;
use crate::transport::{Dispatch, Transport};
use crate::types::{ActuationCommand, CommandOutcome, CommandState, DeviceAck, PendingCommand};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle for collecting one command's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ticket(u64);

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    pub accepted: bool,
    /// Observability only; restarts at 1 whenever the queue drains.
    pub seq: u64,
    pub ticket: Ticket,
}

/// Point-in-time view for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub pending: usize,
    pub executing: Option<u64>,
    pub next_seq: u64,
    /// Seq and terminal state of the most recent command to leave the queue
    pub last_settled: Option<(u64, CommandState)>,
}

struct QueueState {
    pending: VecDeque<PendingCommand>,
    executing: Option<PendingCommand>,
    draining: bool,
    next_seq: u64,
    next_ticket: u64,
    outcomes: HashMap<u64, CommandOutcome>,
    last_settled: Option<(u64, CommandState)>,
}

struct Inner {
    state: Mutex<QueueState>,
    settled: Condvar,
    transport: Mutex<Box<dyn Transport>>,
    acks: Mutex<Option<Receiver<DeviceAck>>>,
    ack_timeout: Duration,
}

#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<Inner>,
}

impl CommandQueue {
    pub fn new(mut transport: Box<dyn Transport>, ack_timeout: Duration) -> Self {
        let acks = transport.take_acks();
        logger::info_p("queue", &format!(
            "ready on {} transport, ack timeout {} ms",
            transport.name(),
            ack_timeout.as_millis()
        ));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    executing: None,
                    draining: false,
                    next_seq: 1,
                    next_ticket: 1,
                    outcomes: HashMap::new(),
                    last_settled: None,
                }),
                settled: Condvar::new(),
                transport: Mutex::new(transport),
                acks: Mutex::new(acks),
                ack_timeout,
            }),
        }
    }

    /// Append one command. If the queue was idle this call executes it (and
    /// anything appended meanwhile) before returning.
    pub fn enqueue(&self, command: ActuationCommand) -> Enqueued {
        self.enqueue_batch(&[command])
            .pop()
            .unwrap_or(Enqueued { accepted: false, seq: 0, ticket: Ticket(0) })
    }

    /// Append commands as one contiguous run; nothing from another caller
    /// can land between them.
    pub fn enqueue_batch(&self, commands: &[ActuationCommand]) -> Vec<Enqueued> {
        let connected = self.transport_connected();
        let (entries, drive) = {
            let mut st = self.inner.state.lock().unwrap();
            let entries: Vec<Enqueued> = commands
                .iter()
                .map(|cmd| {
                    let ticket = st.next_ticket;
                    st.next_ticket += 1;
                    if !connected {
                        st.outcomes.insert(ticket, CommandOutcome::Failed("transport disconnected".into()));
                        logger::warn_p("queue", &format!("rejected {}: transport disconnected", cmd.motion.name()));
                        return Enqueued { accepted: false, seq: 0, ticket: Ticket(ticket) };
                    }
                    let seq = st.next_seq;
                    st.next_seq += 1;
                    st.pending.push_back(PendingCommand {
                        seq,
                        command: *cmd,
                        enqueued_at: Instant::now(),
                        state: CommandState::Queued,
                        ticket,
                    });
                    logger::info_p("queue", &format!("enqueued #{} {}", seq, cmd.motion.name()));
                    Enqueued { accepted: true, seq, ticket: Ticket(ticket) }
                })
                .collect();
            let drive = !st.draining && !st.pending.is_empty();
            if drive {
                st.draining = true;
            }
            (entries, drive)
        };
        if drive {
            self.drain();
        }
        entries
    }

    /// Block until the ticket's command has left the queue.
    pub fn wait(&self, ticket: Ticket) -> CommandOutcome {
        let mut st = self.inner.state.lock().unwrap();
        loop {
            if let Some(outcome) = st.outcomes.remove(&ticket.0) {
                return outcome;
            }
            st = self.inner.settled.wait(st).unwrap();
        }
    }

    /// Enqueue a gesture and wait for every part of it.
    pub fn run(&self, commands: &[ActuationCommand]) -> Vec<CommandOutcome> {
        self.enqueue_batch(commands)
            .into_iter()
            .map(|e| self.wait(e.ticket))
            .collect()
    }

    pub fn status(&self) -> QueueStatus {
        let st = self.inner.state.lock().unwrap();
        QueueStatus {
            pending: st.pending.len(),
            executing: st.executing.as_ref().map(|p| p.seq),
            next_seq: st.next_seq,
            last_settled: st.last_settled,
        }
    }

    /// Read the screen through the same transport. Waits for an in-flight
    /// write to finish.
    pub fn screenshot(&self) -> Option<Vec<u8>> {
        self.inner.transport.lock().unwrap().screenshot()
    }

    pub fn transport_name(&self) -> String {
        self.inner.transport.lock().unwrap().name().to_string()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.lock().unwrap().is_connected()
    }

    // A busy transport lock means a write is in flight, so the link was up.
    fn transport_connected(&self) -> bool {
        match self.inner.transport.try_lock() {
            Ok(t) => t.is_connected(),
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(_)) => false,
        }
    }

    fn drain(&self) {
        loop {
            let mut current = {
                let mut st = self.inner.state.lock().unwrap();
                match st.pending.pop_front() {
                    Some(mut p) => {
                        p.state = CommandState::Executing;
                        st.executing = Some(p.clone());
                        p
                    }
                    None => {
                        st.draining = false;
                        st.executing = None;
                        st.next_seq = 1;
                        self.inner.settled.notify_all();
                        return;
                    }
                }
            };

            let outcome = self.execute(&current);
            current.state = outcome.settled_state();

            let mut st = self.inner.state.lock().unwrap();
            st.executing = None;
            st.last_settled = Some((current.seq, current.state));
            st.outcomes.insert(current.ticket, outcome);
            self.inner.settled.notify_all();
        }
    }

    fn execute(&self, p: &PendingCommand) -> CommandOutcome {
        let acks = self.inner.acks.lock().unwrap();
        if let Some(rx) = acks.as_ref() {
            while let Ok(stale) = rx.try_recv() {
                logger::warn_p("queue", &format!("discarding stale ack {:?}", stale));
            }
        }

        let waited = p.enqueued_at.elapsed().as_millis();
        logger::info_p("queue", &format!("executing #{} {} (queued {} ms)", p.seq, p.command.motion.name(), waited));
        let dispatch = self.inner.transport.lock().unwrap().execute(&p.command);

        let outcome = match dispatch {
            Err(e) => CommandOutcome::Failed(e.to_string()),
            Ok(Dispatch::Completed) => CommandOutcome::Acknowledged,
            Ok(Dispatch::AwaitAck) => match acks.as_ref() {
                None => CommandOutcome::Acknowledged,
                Some(rx) => match rx.recv_timeout(self.inner.ack_timeout) {
                    Ok(DeviceAck::Ready) => CommandOutcome::Acknowledged,
                    Ok(DeviceAck::Error(line)) => CommandOutcome::Failed(line),
                    Err(RecvTimeoutError::Timeout) => CommandOutcome::TimedOut,
                    Err(RecvTimeoutError::Disconnected) => CommandOutcome::Failed("ack stream closed".into()),
                },
            },
        };

        match &outcome {
            CommandOutcome::Acknowledged => logger::info_p("queue", &format!("#{} acknowledged", p.seq)),
            CommandOutcome::Failed(why) => logger::error_p("queue", &format!("#{} failed: {}", p.seq, why)),
            CommandOutcome::TimedOut => logger::warn_p(
                "queue",
                &format!("#{} timed out after {} ms, dropping", p.seq, self.inner.ack_timeout.as_millis()),
            ),
        }
        outcome
    }
}
