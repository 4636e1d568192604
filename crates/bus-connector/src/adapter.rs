use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use message_bus::{
    BusError, BusResult, CommandBus, Handle, HandlerId, Message, Subscribable, Subscriber,
    Subscription, MESSAGE,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::tracked::TrackedIds;

/// Records every message id seen on a bus into the owning adapter's tracked
/// set before passing the message on.
pub struct MessageIdTracker<T: ?Sized, H: ?Sized> {
    tracked: Arc<Mutex<TrackedIds>>,
    target: Arc<H>,
    _subscribed: PhantomData<fn(&T)>,
}

impl<T, H> Handle<dyn Message> for MessageIdTracker<T, H>
where
    T: Subscribable + ?Sized,
    H: Handle<T> + ?Sized,
{
    fn handle(&self, message: &dyn Message) {
        let evicted = self.tracked.lock().insert(message.msg_id());
        if let Some(evicted) = evicted {
            trace!(
                target = "bus_connector",
                msg_id = %evicted,
                "tracked id evicted before it bounced back"
            );
        }
        if let Some(typed) = T::from_message(message) {
            self.target.handle(typed);
        }
    }
}

struct Registration {
    handler: HandlerId,
    _subscription: Subscription,
}

type Slot = Mutex<Option<Registration>>;

/// One side of a bridge: relays foreign traffic onto its bus and drops the
/// copies of its own traffic that come back.
pub struct BusAdapter<B> {
    bus: Arc<B>,
    tracked: Arc<Mutex<TrackedIds>>,
    registration: Arc<Slot>,
}

impl<B> BusAdapter<B>
where
    B: CommandBus + 'static,
{
    pub fn new(bus: Arc<B>, tracked_capacity: usize) -> Self {
        Self {
            bus,
            tracked: Arc::new(Mutex::new(TrackedIds::with_capacity(tracked_capacity))),
            registration: Arc::new(Mutex::new(None)),
        }
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.lock().len()
    }

    pub fn is_subscribed(&self) -> bool {
        self.registration.lock().is_some()
    }

    fn configuration(&self, detail: &str) -> BusError {
        BusError::Configuration(format!("adapter on bus '{}': {detail}", self.bus.bus_name()))
    }
}

impl<B> Handle<dyn Message> for BusAdapter<B>
where
    B: CommandBus + 'static,
{
    fn handle(&self, message: &dyn Message) {
        if self.tracked.lock().take(&message.msg_id()) {
            trace!(
                target = "bus_connector",
                bus = %self.bus.bus_name(),
                message = message.kind().name(),
                msg_id = %message.msg_id(),
                "dropping bounced message"
            );
            return;
        }
        if message.kind().is_command() {
            // the side that fired the command tracks its outcome
            let _relayed = self.bus.try_fire(message);
        } else if let Err(err) = self.bus.publish(message) {
            warn!(
                target = "bus_connector",
                bus = %self.bus.bus_name(),
                message = message.kind().name(),
                error = %err,
                "failed to relay message"
            );
        }
    }
}

impl<B> Subscriber for BusAdapter<B>
where
    B: CommandBus + 'static,
{
    /// Only `dyn Message` is accepted, and only once.
    fn subscribe<T, H>(&self, handler: Arc<H>) -> BusResult<Subscription>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static,
    {
        if T::subscribed_kind() != &MESSAGE {
            return Err(self.configuration(&format!(
                "only Message subscriptions are supported, not {}",
                T::subscribed_kind().name()
            )));
        }
        let handler_id = HandlerId::of(&handler);
        {
            let mut registration = self.registration.lock();
            if registration.is_some() {
                return Err(self.configuration("already has a subscription"));
            }
            let tracker = Arc::new(MessageIdTracker::<T, H> {
                tracked: Arc::clone(&self.tracked),
                target: handler,
                _subscribed: PhantomData,
            });
            let subscription = self.bus.subscribe::<dyn Message, _>(tracker)?;
            *registration = Some(Registration {
                handler: handler_id,
                _subscription: subscription,
            });
        }
        debug!(
            target = "bus_connector",
            bus = %self.bus.bus_name(),
            "adapter subscribed"
        );

        let slot: Weak<Slot> = Arc::downgrade(&self.registration);
        Ok(Subscription::new(move || {
            if let Some(slot) = slot.upgrade() {
                release(&slot, handler_id);
            }
        }))
    }

    /// A no-op when nothing is subscribed; an error for a handler other than
    /// the subscribed one.
    fn unsubscribe<T, H>(&self, handler: &Arc<H>) -> BusResult<()>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static,
    {
        let handler_id = HandlerId::of(handler);
        let removed = {
            let mut registration = self.registration.lock();
            let Some(held) = registration.as_ref().map(|current| current.handler) else {
                return Ok(());
            };
            if held != handler_id {
                return Err(self.configuration("unsubscribe for a handler it does not hold"));
            }
            registration.take()
        };
        drop(removed);
        self.tracked.lock().clear();
        debug!(
            target = "bus_connector",
            bus = %self.bus.bus_name(),
            "adapter unsubscribed"
        );
        Ok(())
    }

    fn has_subscriber_for<T>(&self, include_derived: bool) -> bool
    where
        T: Subscribable + ?Sized,
    {
        self.bus.has_subscriber_for::<T>(include_derived)
    }
}

fn release(slot: &Slot, handler: HandlerId) {
    let removed = {
        let mut registration = slot.lock();
        let held = registration.as_ref().map(|current| current.handler);
        if held == Some(handler) {
            registration.take()
        } else {
            None
        }
    };
    drop(removed);
}

impl<B> std::fmt::Debug for BusAdapter<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusAdapter")
            .field("tracked", &self.tracked.lock().len())
            .field("subscribed", &self.registration.lock().is_some())
            .finish()
    }
}
