use std::fmt;
use std::sync::Arc;

use crate::error::BusResult;
use crate::message::{Message, MessageKind, MessageType, MsgTypeId, MESSAGE};

/// Receives messages of type `T` (or its descendants) from a bus.
pub trait Handle<T: ?Sized>: Send + Sync {
    fn handle(&self, message: &T);
}

impl<T: ?Sized, F> Handle<T> for F
where
    F: Fn(&T) + Send + Sync,
{
    fn handle(&self, message: &T) {
        (self)(message)
    }
}

/// Anything a handler can subscribe to: a concrete message type, or
/// `dyn Message` for every message on the bus.
pub trait Subscribable: 'static {
    fn subscribed_kind() -> &'static MessageKind;
    fn from_message(message: &dyn Message) -> Option<&Self>;
}

impl<T: MessageType> Subscribable for T {
    fn subscribed_kind() -> &'static MessageKind {
        T::message_kind()
    }

    fn from_message(message: &dyn Message) -> Option<&Self> {
        message
            .upcast(T::message_kind())
            .and_then(|view| view.downcast_ref::<T>())
    }
}

impl Subscribable for dyn Message {
    fn subscribed_kind() -> &'static MessageKind {
        &MESSAGE
    }

    fn from_message(message: &dyn Message) -> Option<&Self> {
        Some(message.as_message())
    }
}

/// Identity of a subscribed handler: the address of its `Arc` allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

impl HandlerId {
    pub fn of<H: ?Sized>(handler: &Arc<H>) -> Self {
        Self(Arc::as_ptr(handler) as *const () as usize)
    }
}

pub(crate) fn handler_name<H: ?Sized>() -> Arc<str> {
    let full = std::any::type_name::<H>();
    let base = full.split('<').next().unwrap_or(full);
    let short = base.rsplit("::").next().unwrap_or(base);
    Arc::from(short)
}

/// A type-erased registration of one handler for one exact subscribed type.
pub(crate) struct MessageHandler {
    handler_id: HandlerId,
    subscribed_kind: &'static MessageKind,
    type_id: MsgTypeId,
    name: Arc<str>,
    invoke: Box<dyn Fn(&dyn Message) -> bool + Send + Sync>,
}

impl MessageHandler {
    pub(crate) fn new<T, H>(handler: Arc<H>, type_id: MsgTypeId) -> Self
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static,
    {
        Self {
            handler_id: HandlerId::of(&handler),
            subscribed_kind: T::subscribed_kind(),
            type_id,
            name: handler_name::<H>(),
            invoke: Box::new(move |message| match T::from_message(message) {
                Some(typed) => {
                    handler.handle(typed);
                    true
                }
                None => false,
            }),
        }
    }

    pub(crate) fn is_same(&self, handler_id: HandlerId, type_id: MsgTypeId) -> bool {
        self.handler_id == handler_id && self.type_id == type_id
    }

    pub(crate) fn msg_type_id(&self) -> MsgTypeId {
        self.type_id
    }

    pub(crate) fn subscribed_kind(&self) -> &'static MessageKind {
        self.subscribed_kind
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Returns `false` when the message could not be viewed as the subscribed
    /// type, i.e. a descendant that does not embed its base message.
    pub(crate) fn try_handle(&self, message: &dyn Message) -> bool {
        (self.invoke)(message)
    }
}

impl fmt::Debug for MessageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHandler")
            .field("name", &self.name)
            .field("subscribed", &self.subscribed_kind.name())
            .field("type_id", &self.type_id)
            .finish()
    }
}

/// Token returned by `subscribe`. Dropping it unsubscribes the handler;
/// call [`detach`](Self::detach) to keep the registration for the life of
/// the bus.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A token that releases nothing.
    pub fn empty() -> Self {
        Self { release: None }
    }

    pub fn unsubscribe(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn detach(mut self) {
        self.release = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

pub trait Publisher: Send + Sync {
    fn publish(&self, message: &dyn Message) -> BusResult<()>;
}

pub trait Subscriber: Send + Sync {
    fn subscribe<T, H>(&self, handler: Arc<H>) -> BusResult<Subscription>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static;

    fn unsubscribe<T, H>(&self, handler: &Arc<H>) -> BusResult<()>
    where
        T: Subscribable + ?Sized,
        H: Handle<T> + ?Sized + 'static;

    fn has_subscriber_for<T>(&self, include_derived: bool) -> bool
    where
        T: Subscribable + ?Sized;
}
