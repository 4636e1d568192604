//! Command dispatch on top of [`MessageBus`].
//!
//! A command is an ordinary broadcast message with one extra contract: exactly
//! one subscriber acknowledges it and answers with a [`CommandResponse`]. The
//! [`Dispatcher`] keeps a [`CommandTracker`] per fired command and routes the
//! [`AckCommand`] / [`CommandResponse`] traffic seen on its bus to it.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle as RuntimeHandle;
use tracing::{debug, error, warn};

use crate::bus::{panic_message, MessageBus};
use crate::config::{CommandTimeouts, DispatcherConfig};
use crate::error::{BusError, BusResult};
use crate::handler::{
    handler_name, Handle, HandlerId, Publisher, Subscribable, Subscriber, Subscription,
};
use crate::hierarchy::MessageHierarchy;
use crate::message::{AckCommand, Command, CommandResponse, Message, MsgId};
use crate::telemetry::DispatchStats;
use crate::tracker::{CommandTracker, PendingCommand};

/// Claims and answers commands of type `C`.
pub trait HandleCommand<C: ?Sized>: Send + Sync {
    fn handle(&self, command: &C) -> CommandResponse;
}

impl<C: ?Sized, F> HandleCommand<C> for F
where
    F: Fn(&C) -> CommandResponse + Send + Sync,
{
    fn handle(&self, command: &C) -> CommandResponse {
        (self)(command)
    }
}

pub trait CommandSubscriber: Send + Sync {
    /// Registers the single handler for `C`.
    fn subscribe_command<C, H>(&self, handler: Arc<H>) -> BusResult<Subscription>
    where
        C: Command,
        H: HandleCommand<C> + ?Sized + 'static;

    fn unsubscribe_command<C, H>(&self, handler: &Arc<H>) -> BusResult<()>
    where
        C: Command,
        H: HandleCommand<C> + ?Sized + 'static;
}

/// A bus that can also deliver commands to a single claimant.
pub trait CommandBus: Publisher + Subscriber {
    fn bus_name(&self) -> &str;

    /// Fires `command` if it is one; logs and returns `None` otherwise.
    fn try_fire(&self, command: &dyn Message) -> Option<PendingCommand>;
}

#[derive(Default)]
struct InFlight {
    trackers: Mutex<HashMap<MsgId, Arc<CommandTracker>>>,
}

impl InFlight {
    fn get(&self, command_id: MsgId) -> Option<Arc<CommandTracker>> {
        self.trackers.lock().get(&command_id).cloned()
    }

    fn insert(&self, tracker: Arc<CommandTracker>) {
        self.trackers.lock().insert(tracker.command_id(), tracker);
    }

    fn remove(&self, command_id: MsgId) -> Option<Arc<CommandTracker>> {
        self.trackers.lock().remove(&command_id)
    }

    fn drain(&self) -> Vec<Arc<CommandTracker>> {
        self.trackers.lock().drain().map(|(_, tracker)| tracker).collect()
    }

    fn len(&self) -> usize {
        self.trackers.lock().len()
    }
}

struct CommandRegistration {
    handler: HandlerId,
    // dropping it unsubscribes the responder from the bus
    _subscription: Subscription,
}

type CommandRegistrations = Mutex<HashMap<&'static str, CommandRegistration>>;

/// Wraps a [`HandleCommand`] so it acks, runs, and publishes its response.
struct CommandResponder<C, H: ?Sized> {
    bus: Weak<MessageBus>,
    handler: Arc<H>,
    name: Arc<str>,
    _command: PhantomData<fn(&C)>,
}

impl<C, H> Handle<C> for CommandResponder<C, H>
where
    C: Command,
    H: HandleCommand<C> + ?Sized,
{
    fn handle(&self, command: &C) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        if let Err(err) = bus.publish(&AckCommand::new(command)) {
            warn!(
                target = "message_bus.dispatcher",
                command = command.kind().name(),
                error = %err,
                "failed to acknowledge command"
            );
            return;
        }
        let response =
            match panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(command))) {
                Ok(response) => response,
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    error!(
                        target = "message_bus.dispatcher",
                        command = command.kind().name(),
                        handler = %self.name,
                        panic = %reason,
                        "command handler panicked"
                    );
                    CommandResponse::fail(command, format!("command handler panicked: {reason}"))
                }
            };
        if let Err(err) = bus.publish(&response) {
            warn!(
                target = "message_bus.dispatcher",
                command = command.kind().name(),
                error = %err,
                "failed to publish command response"
            );
        }
    }
}

/// A [`MessageBus`] plus command tracking.
pub struct Dispatcher {
    bus: Arc<MessageBus>,
    runtime: RuntimeHandle,
    timeouts: CommandTimeouts,
    in_flight: Arc<InFlight>,
    commands: Arc<CommandRegistrations>,
}

impl Dispatcher {
    /// Timers for fired commands run on `runtime`.
    pub fn new(
        name: impl Into<String>,
        registry: Arc<MessageHierarchy>,
        config: DispatcherConfig,
        runtime: RuntimeHandle,
    ) -> BusResult<Arc<Self>> {
        let bus = MessageBus::new(name, registry, config.bus);
        let in_flight = Arc::new(InFlight::default());

        let acks = Arc::downgrade(&in_flight);
        bus.subscribe::<AckCommand, _>(Arc::new(move |ack: &AckCommand| {
            if let Some(tracker) = acks.upgrade().and_then(|table| table.get(ack.command_id())) {
                tracker.handle_ack(ack);
            }
        }))?
        .detach();

        let responses = Arc::downgrade(&in_flight);
        bus.subscribe::<CommandResponse, _>(Arc::new(move |response: &CommandResponse| {
            if let Some(tracker) = responses
                .upgrade()
                .and_then(|table| table.get(response.command_id()))
            {
                tracker.handle_response(response);
            }
        }))?
        .detach();

        Ok(Arc::new(Self {
            bus,
            runtime,
            timeouts: config.timeouts,
            in_flight,
            commands: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    pub fn name(&self) -> &str {
        self.bus.name()
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<MessageHierarchy> {
        self.bus.registry()
    }

    pub fn timeouts(&self) -> CommandTimeouts {
        self.timeouts
    }

    pub fn stats(&self) -> DispatchStats {
        self.bus.stats()
    }

    /// Commands fired from this dispatcher that have no outcome yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn publish(&self, message: &dyn Message) -> BusResult<()> {
        self.bus.publish(message)
    }

    pub fn fire<C: Command>(&self, command: &C) -> BusResult<PendingCommand> {
        self.send(command)
    }

    /// Untyped [`fire`](Self::fire).
    pub fn send(&self, command: &dyn Message) -> BusResult<PendingCommand> {
        let kind = command.kind();
        if self.bus.is_disposed() {
            return Err(BusError::Disposed {
                bus: self.bus.name().to_owned(),
            });
        }
        if !kind.is_command() {
            return Err(BusError::NotACommand { kind: kind.name() });
        }

        let on_complete = Arc::downgrade(&self.in_flight);
        let on_cancel = on_complete.clone();
        let (tracker, pending) = CommandTracker::start(
            command,
            self.timeouts,
            &self.runtime,
            move |command_id| {
                if let Some(table) = on_complete.upgrade() {
                    table.remove(command_id);
                }
            },
            move |command_id| {
                if let Some(table) = on_cancel.upgrade() {
                    table.remove(command_id);
                }
            },
        );
        self.in_flight.insert(tracker);

        if let Err(err) = self.bus.publish(command) {
            if let Some(tracker) = self.in_flight.remove(command.msg_id()) {
                tracker.dispose();
            }
            return Err(err);
        }
        Ok(pending)
    }

    /// Disposes every in-flight tracker, then the bus.
    pub fn dispose(&self) {
        for tracker in self.in_flight.drain() {
            tracker.dispose();
        }
        self.bus.dispose();
        let registrations: Vec<_> = self.commands.lock().drain().collect();
        drop(registrations);
        debug!(
            target = "message_bus.dispatcher",
            bus = %self.bus.name(),
            "dispatcher disposed"
        );
    }

    fn remove_command(&self, command: &'static str, handler: HandlerId) -> bool {
        remove_command(&self.commands, command, handler)
    }
}

fn remove_command(commands: &CommandRegistrations, command: &'static str, handler: HandlerId) -> bool {
    let removed = {
        let mut commands = commands.lock();
        let held = commands.get(command).map(|registration| registration.handler);
        if held == Some(handler) {
            commands.remove(command)
        } else {
            None
        }
    };
    // the bus subscription is released here, outside the table lock
    removed.is_some()
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for tracker in self.in_flight.drain() {
            tracker.dispose();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("bus", &self.bus)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Publisher for Dispatcher {
    fn publish(&self, message: &dyn Message) -> BusResult<()> {
        self.bus.publish(message)
    }
}

impl Subscriber for Dispatcher {
    fn subscribe<T, H>(&self, handler: Arc<H>) -> BusResult<Subscription>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static,
    {
        self.bus.subscribe::<T, H>(handler)
    }

    fn unsubscribe<T, H>(&self, handler: &Arc<H>) -> BusResult<()>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static,
    {
        self.bus.unsubscribe::<T, H>(handler)
    }

    fn has_subscriber_for<T>(&self, include_derived: bool) -> bool
    where
        T: Subscribable + ?Sized,
    {
        self.bus.has_subscriber_for::<T>(include_derived)
    }
}

impl CommandSubscriber for Dispatcher {
    fn subscribe_command<C, H>(&self, handler: Arc<H>) -> BusResult<Subscription>
    where
        C: Command,
        H: HandleCommand<C> + ?Sized + 'static,
    {
        let command = C::message_kind().name();
        let handler_id = HandlerId::of(&handler);
        let name = handler_name::<H>();
        {
            let mut commands = self.commands.lock();
            if commands.contains_key(command) {
                return Err(BusError::DuplicateCommandHandler { command });
            }
            let responder = Arc::new(CommandResponder::<C, H> {
                bus: Arc::downgrade(&self.bus),
                handler,
                name: name.clone(),
                _command: PhantomData,
            });
            let subscription = self.bus.subscribe::<C, _>(responder)?;
            commands.insert(
                command,
                CommandRegistration {
                    handler: handler_id,
                    _subscription: subscription,
                },
            );
        }
        debug!(
            target = "message_bus.dispatcher",
            bus = %self.bus.name(),
            command,
            handler = %name,
            "command handler subscribed"
        );

        let commands = Arc::downgrade(&self.commands);
        Ok(Subscription::new(move || {
            if let Some(commands) = commands.upgrade() {
                remove_command(&commands, command, handler_id);
            }
        }))
    }

    fn unsubscribe_command<C, H>(&self, handler: &Arc<H>) -> BusResult<()>
    where
        C: Command,
        H: HandleCommand<C> + ?Sized + 'static,
    {
        if self.bus.is_disposed() {
            return Err(BusError::Disposed {
                bus: self.bus.name().to_owned(),
            });
        }
        let command = C::message_kind().name();
        if self.remove_command(command, HandlerId::of(handler)) {
            debug!(
                target = "message_bus.dispatcher",
                bus = %self.bus.name(),
                command,
                "command handler unsubscribed"
            );
        }
        Ok(())
    }
}

impl CommandBus for Dispatcher {
    fn bus_name(&self) -> &str {
        self.bus.name()
    }

    fn try_fire(&self, command: &dyn Message) -> Option<PendingCommand> {
        match self.send(command) {
            Ok(pending) => Some(pending),
            Err(err) => {
                warn!(
                    target = "message_bus.dispatcher",
                    bus = %self.bus.name(),
                    command = command.kind().name(),
                    msg_id = %command.msg_id(),
                    error = %err,
                    "command rejected"
                );
                None
            }
        }
    }
}
