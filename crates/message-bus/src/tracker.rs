//! Ack / response tracking for a single in-flight command.
//!
//! The tracker is a three-state machine held in one atomic word:
//!
//! ```text
//! PendingAck --first ack--> PendingResponse --response--> Complete
//!     |                          |
//!     +--ack timeout / response--+--response timeout / extra ack--> Complete
//! ```
//!
//! Several events can race (an ack on a publishing thread against the ack
//! timer, for instance). State moves are compare-and-swap; the outcome itself
//! is delivered through a oneshot whose sender is taken exactly once, so the
//! first event to take it decides the result and everything after is a no-op.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::CommandTimeouts;
use crate::error::{CommandError, CommandResult};
use crate::message::{AckCommand, CommandResponse, Message, MessageKind, MsgId};

const PENDING_ACK: u8 = 0;
const PENDING_RESPONSE: u8 = 1;
const COMPLETE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    PendingAck,
    PendingResponse,
    Complete,
}

impl TrackerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            PENDING_ACK => TrackerState::PendingAck,
            PENDING_RESPONSE => TrackerState::PendingResponse,
            _ => TrackerState::Complete,
        }
    }
}

type Callback = Box<dyn Fn(MsgId) + Send + Sync>;

pub struct CommandTracker {
    command_id: MsgId,
    command: &'static MessageKind,
    state: AtomicU8,
    acks: AtomicUsize,
    result: Mutex<Option<oneshot::Sender<CommandResult>>>,
    timers: CancellationToken,
    timeouts: CommandTimeouts,
    runtime: Handle,
    on_complete: Callback,
    on_cancel: Callback,
    weak_self: Weak<CommandTracker>,
}

impl CommandTracker {
    /// Starts tracking `command` and arms the ack timer.
    ///
    /// `on_complete` runs when a response decides the outcome, `on_cancel`
    /// when a timeout or oversubscription does. At most one of them runs, at
    /// most once.
    pub fn start(
        command: &dyn Message,
        timeouts: CommandTimeouts,
        runtime: &Handle,
        on_complete: impl Fn(MsgId) + Send + Sync + 'static,
        on_cancel: impl Fn(MsgId) + Send + Sync + 'static,
    ) -> (Arc<Self>, PendingCommand) {
        let (sender, receiver) = oneshot::channel();
        let command_id = command.msg_id();
        let kind = command.kind();
        let tracker = Arc::new_cyclic(|weak_self| Self {
            command_id,
            command: kind,
            state: AtomicU8::new(PENDING_ACK),
            acks: AtomicUsize::new(0),
            result: Mutex::new(Some(sender)),
            timers: CancellationToken::new(),
            timeouts,
            runtime: runtime.clone(),
            on_complete: Box::new(on_complete),
            on_cancel: Box::new(on_cancel),
            weak_self: weak_self.clone(),
        });
        trace!(
            target = "message_bus.tracker",
            command = kind.name(),
            command_id = %command_id,
            ack_timeout_ms = timeouts.ack_timeout.as_millis() as u64,
            "tracking command"
        );
        tracker.schedule(timeouts.ack_timeout, CommandTracker::ack_timeout);
        let pending = PendingCommand {
            command_id,
            command: kind,
            receiver,
            settled: None,
        };
        (tracker, pending)
    }

    pub fn command_id(&self) -> MsgId {
        self.command_id
    }

    pub fn command_kind(&self) -> &'static MessageKind {
        self.command
    }

    pub fn state(&self) -> TrackerState {
        TrackerState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::Acquire)
    }

    pub fn is_resolved(&self) -> bool {
        self.result.lock().is_none()
    }

    fn schedule(&self, after: Duration, fire: fn(&CommandTracker)) {
        let token = self.timers.clone();
        let tracker = self.weak_self.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    if let Some(tracker) = tracker.upgrade() {
                        fire(&tracker);
                    }
                }
            }
        });
    }

    /// Takes the result sender. Only the caller that gets `true` back may log
    /// or run a callback for the outcome.
    fn resolve(&self, outcome: CommandResult) -> bool {
        let Some(sender) = self.result.lock().take() else {
            return false;
        };
        self.timers.cancel();
        // the caller may have stopped waiting; the outcome still counts
        let _ = sender.send(outcome);
        true
    }

    pub fn handle_ack(&self, ack: &AckCommand) {
        if ack.command_id() != self.command_id {
            return;
        }
        let acks = self.acks.fetch_add(1, Ordering::AcqRel) + 1;
        match self.state.compare_exchange(
            PENDING_ACK,
            PENDING_RESPONSE,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                trace!(
                    target = "message_bus.tracker",
                    command = self.command.name(),
                    command_id = %self.command_id,
                    "command acknowledged"
                );
                self.schedule(self.timeouts.response_timeout, CommandTracker::response_timeout);
            }
            Err(_) => {
                self.state.store(COMPLETE, Ordering::Release);
                let error = CommandError::Oversubscribed {
                    command: self.command.name(),
                };
                if self.resolve(Err(error)) {
                    error!(
                        target = "message_bus.tracker",
                        command = self.command.name(),
                        command_id = %self.command_id,
                        acks,
                        "command oversubscribed: more than one handler acknowledged it"
                    );
                    (self.on_cancel)(self.command_id);
                }
            }
        }
    }

    /// Accepted in any state, including before an ack.
    pub fn handle_response(&self, response: &CommandResponse) {
        if response.command_id() != self.command_id {
            return;
        }
        let previous = self.state.swap(COMPLETE, Ordering::AcqRel);
        if self.resolve(Ok(response.clone())) {
            debug!(
                target = "message_bus.tracker",
                command = self.command.name(),
                command_id = %self.command_id,
                acknowledged = previous != PENDING_ACK,
                success = response.is_success(),
                "command completed"
            );
            (self.on_complete)(self.command_id);
        }
    }

    pub fn ack_timeout(&self) {
        if self
            .state
            .compare_exchange(PENDING_ACK, COMPLETE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let error = CommandError::NotHandled {
            command: self.command.name(),
        };
        if self.resolve(Err(error)) {
            error!(
                target = "message_bus.tracker",
                command = self.command.name(),
                command_id = %self.command_id,
                timeout_ms = self.timeouts.ack_timeout.as_millis() as u64,
                "command not handled: no handler acknowledged it in time"
            );
            (self.on_cancel)(self.command_id);
        }
    }

    pub fn response_timeout(&self) {
        if self
            .state
            .compare_exchange(PENDING_RESPONSE, COMPLETE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let error = CommandError::TimedOut {
            command: self.command.name(),
        };
        if self.resolve(Err(error)) {
            error!(
                target = "message_bus.tracker",
                command = self.command.name(),
                command_id = %self.command_id,
                timeout_ms = self.timeouts.response_timeout.as_millis() as u64,
                "command timed out waiting for its response"
            );
            (self.on_cancel)(self.command_id);
        }
    }

    /// Stops both timers. A caller still waiting sees
    /// [`CommandError::Cancelled`]. Runs no callback.
    pub fn dispose(&self) {
        self.timers.cancel();
        self.state.store(COMPLETE, Ordering::Release);
        if self.result.lock().take().is_some() {
            debug!(
                target = "message_bus.tracker",
                command = self.command.name(),
                command_id = %self.command_id,
                "command tracking cancelled"
            );
        }
    }
}

impl Drop for CommandTracker {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for CommandTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandTracker")
            .field("command", &self.command.name())
            .field("command_id", &self.command_id)
            .field("state", &self.state())
            .field("acks", &self.ack_count())
            .finish()
    }
}

/// Outcome of a fired command. Resolves exactly once.
#[must_use = "a PendingCommand does nothing unless awaited or polled"]
#[derive(Debug)]
pub struct PendingCommand {
    command_id: MsgId,
    command: &'static MessageKind,
    receiver: oneshot::Receiver<CommandResult>,
    settled: Option<CommandResult>,
}

impl PendingCommand {
    pub fn command_id(&self) -> MsgId {
        self.command_id
    }

    pub fn command_kind(&self) -> &'static MessageKind {
        self.command
    }

    fn cancelled(&self) -> CommandResult {
        Err(CommandError::Cancelled {
            command: self.command.name(),
        })
    }

    /// The outcome if one has been decided, without waiting.
    pub fn try_result(&mut self) -> Option<CommandResult> {
        if self.settled.is_none() {
            let outcome = match self.receiver.try_recv() {
                Ok(outcome) => outcome,
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => self.cancelled(),
            };
            self.settled = Some(outcome);
        }
        self.settled.clone()
    }
}

impl Future for PendingCommand {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.settled.clone() {
            return Poll::Ready(outcome);
        }
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                self.settled = Some(outcome.clone());
                Poll::Ready(outcome)
            }
            Poll::Ready(Err(_)) => {
                let outcome = self.cancelled();
                self.settled = Some(outcome.clone());
                Poll::Ready(outcome)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{new_msg_id, COMMAND};

    static PROBE: MessageKind = MessageKind::derived("tracker.Probe", &COMMAND);

    #[derive(Debug)]
    struct Probe {
        msg_id: MsgId,
    }
    crate::impl_command!(Probe, &PROBE);

    fn probe() -> Probe {
        Probe {
            msg_id: new_msg_id(),
        }
    }

    #[derive(Default)]
    struct Calls {
        completed: AtomicUsize,
        cancelled: AtomicUsize,
    }

    impl Calls {
        fn counts(&self) -> (usize, usize) {
            (
                self.completed.load(Ordering::SeqCst),
                self.cancelled.load(Ordering::SeqCst),
            )
        }
    }

    fn start(
        command: &Probe,
        ack_ms: u64,
        response_ms: u64,
    ) -> (Arc<CommandTracker>, PendingCommand, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let completed = calls.clone();
        let cancelled = calls.clone();
        let (tracker, pending) = CommandTracker::start(
            command,
            CommandTimeouts::new(
                Duration::from_millis(ack_ms),
                Duration::from_millis(response_ms),
            ),
            &Handle::current(),
            move |_| {
                completed.completed.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                cancelled.cancelled.fetch_add(1, Ordering::SeqCst);
            },
        );
        (tracker, pending, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn no_ack_resolves_not_handled() {
        let command = probe();
        let (tracker, pending, calls) = start(&command, 10, 1000);
        let outcome = pending.await;
        assert_eq!(
            outcome,
            Err(CommandError::NotHandled {
                command: "tracker.Probe"
            })
        );
        assert_eq!(tracker.state(), TrackerState::Complete);
        assert_eq!(calls.counts(), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_then_response_succeeds() {
        let command = probe();
        let (tracker, pending, calls) = start(&command, 10, 1000);
        tracker.handle_ack(&AckCommand::new(&command));
        assert_eq!(tracker.state(), TrackerState::PendingResponse);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tracker.state(), TrackerState::PendingResponse, "ack timer disarmed");

        tracker.handle_response(&CommandResponse::success(&command));
        let response = pending.await.expect("response");
        assert_eq!(response.command_id(), command.msg_id);
        assert_eq!(calls.counts(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn ack_without_response_times_out() {
        let command = probe();
        let (tracker, pending, calls) = start(&command, 10, 100);
        tracker.handle_ack(&AckCommand::new(&command));
        assert_eq!(
            pending.await,
            Err(CommandError::TimedOut {
                command: "tracker.Probe"
            })
        );
        assert_eq!(calls.counts(), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn second_ack_is_oversubscription() {
        let command = probe();
        let (tracker, mut pending, calls) = start(&command, 10, 100);
        tracker.handle_ack(&AckCommand::new(&command));
        tracker.handle_ack(&AckCommand::new(&command));
        assert_eq!(tracker.ack_count(), 2);
        assert_eq!(
            pending.try_result(),
            Some(Err(CommandError::Oversubscribed {
                command: "tracker.Probe"
            }))
        );

        // the response timer armed by the first ack must stay inert
        tokio::time::sleep(Duration::from_millis(500)).await;
        tracker.handle_response(&CommandResponse::success(&command));
        assert_eq!(
            pending.await,
            Err(CommandError::Oversubscribed {
                command: "tracker.Probe"
            })
        );
        assert_eq!(calls.counts(), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn response_without_ack_completes_directly() {
        let command = probe();
        let (tracker, pending, calls) = start(&command, 10, 1000);
        let payload = serde_json::json!({ "ok": true });
        tracker.handle_response(&CommandResponse::success(&command).with_payload(payload.clone()));
        assert_eq!(tracker.state(), TrackerState::Complete);

        let response = pending.await.expect("response");
        assert_eq!(response.payload(), Some(&payload));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.counts(), (1, 0), "ack timer stays quiet");
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_ids_are_ignored() {
        let command = probe();
        let other = probe();
        let (tracker, mut pending, _calls) = start(&command, 10, 1000);
        tracker.handle_ack(&AckCommand::new(&other));
        tracker.handle_response(&CommandResponse::success(&other));
        assert_eq!(tracker.state(), TrackerState::PendingAck);
        assert_eq!(pending.try_result(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_cancels_waiters_once() {
        let command = probe();
        let (tracker, pending, calls) = start(&command, 10, 1000);
        tracker.dispose();
        tracker.dispose();
        assert_eq!(
            pending.await,
            Err(CommandError::Cancelled {
                command: "tracker.Probe"
            })
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.counts(), (0, 0));
        assert!(tracker.is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn late_events_after_timeout_are_no_ops() {
        let command = probe();
        let (tracker, mut pending, calls) = start(&command, 10, 1000);
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.handle_ack(&AckCommand::new(&command));
        tracker.handle_response(&CommandResponse::success(&command));
        tracker.response_timeout();
        assert_eq!(
            pending.try_result(),
            Some(Err(CommandError::NotHandled {
                command: "tracker.Probe"
            }))
        );
        assert_eq!(calls.counts(), (0, 1));
    }
}
