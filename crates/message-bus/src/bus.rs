//! Synchronous, broadcast, type-hierarchy-aware dispatch.
//!
//! Handlers live in a table indexed by [`MsgTypeId`]. A handler subscribed
//! for `T` sits in the slot of every type in `T`'s descendant closure, so a
//! publish is one slot lookup followed by an in-order fan-out.
//!
//! Structural changes (subscribe, unsubscribe, registry growth) run under one
//! mutex and finish by swapping in a freshly built immutable table. `publish`
//! only clones the current `Arc` and never waits for a rebuild; a handler may
//! subscribe or unsubscribe from inside its own dispatch.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::config::BusConfig;
use crate::error::{BusError, BusResult};
use crate::handler::{Handle, HandlerId, MessageHandler, Publisher, Subscribable, Subscriber, Subscription};
use crate::hierarchy::{MessageHierarchy, ObserverId};
use crate::message::{Message, MessageKind, MsgTypeId};
use crate::telemetry::{DispatchCounters, DispatchStats};

#[derive(Default)]
struct HandlerTable {
    slots: Vec<Vec<Arc<MessageHandler>>>,
}

impl HandlerTable {
    fn build(registry: &MessageHierarchy, registrations: &[Arc<MessageHandler>]) -> Self {
        let mut slots: Vec<Vec<Arc<MessageHandler>>> =
            vec![Vec::new(); registry.max_type_id().index() + 1];
        for registration in registrations {
            for id in registry.descendants_of(registration.msg_type_id()) {
                if id.index() >= slots.len() {
                    slots.resize_with(id.index() + 1, Vec::new);
                }
                slots[id.index()].push(Arc::clone(registration));
            }
        }
        Self { slots }
    }

    fn handlers_for(&self, id: MsgTypeId) -> &[Arc<MessageHandler>] {
        self.slots.get(id.index()).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub struct MessageBus {
    name: String,
    registry: Arc<MessageHierarchy>,
    config: BusConfig,
    // registration order; the table is derived from it
    registrations: Mutex<Vec<Arc<MessageHandler>>>,
    table: RwLock<Arc<HandlerTable>>,
    observer: Mutex<Option<ObserverId>>,
    disposed: AtomicBool,
    counters: DispatchCounters,
    weak_self: Weak<MessageBus>,
}

impl MessageBus {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<MessageHierarchy>,
        config: BusConfig,
    ) -> Arc<Self> {
        let bus = Arc::new_cyclic(|weak_self| Self {
            name: name.into(),
            table: RwLock::new(Arc::new(HandlerTable::build(&registry, &[]))),
            registry,
            config,
            registrations: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
            disposed: AtomicBool::new(false),
            counters: DispatchCounters::default(),
            weak_self: weak_self.clone(),
        });
        let weak = Arc::downgrade(&bus);
        let observer = bus.registry.observe(move || {
            if let Some(bus) = weak.upgrade() {
                bus.rebuild();
            }
        });
        *bus.observer.lock() = Some(observer);
        bus
    }

    /// A bus with default timing on its own fresh registry.
    pub fn standalone(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, MessageHierarchy::new(), BusConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<MessageHierarchy> {
        &self.registry
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub fn subscription_count(&self) -> usize {
        self.registrations.lock().len()
    }

    fn ensure_live(&self) -> BusResult<()> {
        if self.is_disposed() {
            return Err(BusError::Disposed {
                bus: self.name.clone(),
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> Arc<HandlerTable> {
        Arc::clone(&self.table.read())
    }

    fn install(&self, registrations: &[Arc<MessageHandler>]) {
        let table = HandlerTable::build(&self.registry, registrations);
        *self.table.write() = Arc::new(table);
    }

    /// Rebuilds the whole table after the registry grew.
    fn rebuild(&self) {
        let registrations = self.registrations.lock();
        if self.is_disposed() {
            return;
        }
        self.install(&registrations);
        debug!(
            target = "message_bus",
            bus = %self.name,
            types = self.registry.len(),
            handlers = registrations.len(),
            "rebuilt handler table after registry growth"
        );
    }

    fn remove_registration(&self, handler_id: HandlerId, type_id: MsgTypeId) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|existing| !existing.is_same(handler_id, type_id));
        let removed = registrations.len() != before;
        if removed && !self.is_disposed() {
            self.install(&registrations);
        }
        removed
    }

    /// Fans `message` out to every handler registered for its runtime type,
    /// in registration order.
    pub fn publish(&self, message: &dyn Message) -> BusResult<()> {
        self.ensure_live()?;
        let kind = message.kind();
        let type_id = self.registry.type_id_or_register(kind);
        let table = self.snapshot();
        let handlers = table.handlers_for(type_id);
        self.counters.record_published();

        if handlers.is_empty() {
            self.counters.record_unhandled();
            warn!(
                target = "message_bus",
                bus = %self.name,
                message = kind.name(),
                msg_id = %message.msg_id(),
                "message not handled (no handler)"
            );
            return Ok(());
        }

        let mut first_panic: Option<Box<dyn std::any::Any + Send>> = None;
        for handler in handlers {
            trace!(
                target = "message_bus",
                bus = %self.name,
                message = kind.name(),
                handler = handler.name(),
                "dispatching"
            );
            let started = self.config.watch_slow.then(Instant::now);
            match panic::catch_unwind(AssertUnwindSafe(|| handler.try_handle(message))) {
                Ok(true) => {}
                Ok(false) => error!(
                    target = "message_bus",
                    bus = %self.name,
                    message = kind.name(),
                    handler = handler.name(),
                    subscribed = handler.subscribed_kind().name(),
                    "message has no view of the subscribed type; embed its base with `base = ..`"
                ),
                Err(payload) => {
                    self.counters.record_panic();
                    error!(
                        target = "message_bus",
                        bus = %self.name,
                        message = kind.name(),
                        handler = handler.name(),
                        panic = panic_message(payload.as_ref()),
                        "bus handler panicked"
                    );
                    first_panic.get_or_insert(payload);
                }
            }
            let elapsed = started.map(|started| started.elapsed());
            self.counters.record_delivery(elapsed);
            if let Some(elapsed) = elapsed {
                self.check_slow(kind, handler, elapsed);
            }
        }

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
        Ok(())
    }

    fn check_slow(&self, kind: &MessageKind, handler: &MessageHandler, elapsed: Duration) {
        if elapsed <= self.config.slow_threshold {
            return;
        }
        let elapsed_ms = elapsed.as_millis() as u64;
        let very_slow = elapsed > self.config.very_slow_threshold;
        self.counters.record_slow(very_slow);
        if very_slow {
            error!(
                target = "message_bus",
                bus = %self.name,
                message = kind.name(),
                elapsed_ms,
                handler = handler.name(),
                "very slow bus message"
            );
        } else {
            warn!(
                target = "message_bus",
                bus = %self.name,
                message = kind.name(),
                elapsed_ms,
                handler = handler.name(),
                "slow bus message"
            );
        }
    }

    pub fn subscribe<T, H>(&self, handler: Arc<H>) -> BusResult<Subscription>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static,
    {
        self.ensure_live()?;
        // registering first lets any growth rebuild finish before we lock
        let type_id = self.registry.register(T::subscribed_kind());
        let handler_id = HandlerId::of(&handler);
        {
            let mut registrations = self.registrations.lock();
            self.ensure_live()?;
            if registrations
                .iter()
                .any(|existing| existing.is_same(handler_id, type_id))
            {
                trace!(
                    target = "message_bus",
                    bus = %self.name,
                    subscribed = T::subscribed_kind().name(),
                    "handler already subscribed"
                );
            } else {
                let registration = Arc::new(MessageHandler::new::<T, H>(handler, type_id));
                debug!(
                    target = "message_bus",
                    bus = %self.name,
                    subscribed = T::subscribed_kind().name(),
                    handler = registration.name(),
                    "subscribed handler"
                );
                registrations.push(registration);
                self.install(&registrations);
            }
        }

        let bus = self.weak_self.clone();
        Ok(Subscription::new(move || {
            if let Some(bus) = bus.upgrade() {
                bus.remove_registration(handler_id, type_id);
            }
        }))
    }

    /// Removes the registration for exactly `T`; a no-op when absent.
    pub fn unsubscribe<T, H>(&self, handler: &Arc<H>) -> BusResult<()>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static,
    {
        self.ensure_live()?;
        let Some(type_id) = self.registry.type_id(T::subscribed_kind()) else {
            return Ok(());
        };
        if self.remove_registration(HandlerId::of(handler), type_id) {
            debug!(
                target = "message_bus",
                bus = %self.name,
                subscribed = T::subscribed_kind().name(),
                "unsubscribed handler"
            );
        }
        Ok(())
    }

    /// With `include_derived == false`, true only for handlers subscribed to
    /// exactly `T`; otherwise for any handler that would receive a `T`.
    pub fn has_subscriber_for<T>(&self, include_derived: bool) -> bool
    where
        T: Subscribable + ?Sized,
    {
        if self.is_disposed() {
            return false;
        }
        let Some(type_id) = self.registry.type_id(T::subscribed_kind()) else {
            return false;
        };
        self.snapshot()
            .handlers_for(type_id)
            .iter()
            .any(|handler| include_derived || handler.msg_type_id() == type_id)
    }

    /// Clears every handler slot and detaches from the registry. Later calls
    /// fail with [`BusError::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut registrations = self.registrations.lock();
            registrations.clear();
            *self.table.write() = Arc::new(HandlerTable::default());
        }
        self.release_observer();
        debug!(target = "message_bus", bus = %self.name, "bus disposed");
    }

    fn release_observer(&self) {
        if let Some(observer) = self.observer.lock().take() {
            self.registry.remove_observer(observer);
        }
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.release_observer();
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("name", &self.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl Publisher for MessageBus {
    fn publish(&self, message: &dyn Message) -> BusResult<()> {
        MessageBus::publish(self, message)
    }
}

/// A bus subscribed to another bus republishes what it receives.
impl Handle<dyn Message> for MessageBus {
    fn handle(&self, message: &dyn Message) {
        if let Err(err) = self.publish(message) {
            warn!(
                target = "message_bus",
                bus = %self.name,
                message = message.kind().name(),
                error = %err,
                "dropped forwarded message"
            );
        }
    }
}

impl Subscriber for MessageBus {
    fn subscribe<T, H>(&self, handler: Arc<H>) -> BusResult<Subscription>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static,
    {
        MessageBus::subscribe::<T, H>(self, handler)
    }

    fn unsubscribe<T, H>(&self, handler: &Arc<H>) -> BusResult<()>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static,
    {
        MessageBus::unsubscribe::<T, H>(self, handler)
    }

    fn has_subscriber_for<T>(&self, include_derived: bool) -> bool
    where
        T: Subscribable + ?Sized,
    {
        MessageBus::has_subscriber_for::<T>(self, include_derived)
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
