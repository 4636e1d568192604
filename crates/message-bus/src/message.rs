//! Message model: type tags, the object-safe [`Message`] trait and the
//! command protocol messages.
//!
//! Every concrete message type carries a static [`MessageKind`]. Kinds form a
//! tree rooted at [`MESSAGE`]; the registry turns that tree into integer type
//! ids and descendant closures for dispatch.
//!
//! A message type that derives from another concrete message type embeds the
//! parent value and names the field with `base = ..`. Handlers subscribed to
//! the parent then receive the embedded parent view of every descendant.
//!
//! ```ignore
//! static ORDER_PLACED: MessageKind = MessageKind::derived("OrderPlaced", &MESSAGE);
//! static RUSH_ORDER: MessageKind = MessageKind::derived("RushOrder", &ORDER_PLACED);
//!
//! #[derive(Debug)]
//! struct OrderPlaced { msg_id: MsgId, order: u64 }
//! impl_message!(OrderPlaced, &ORDER_PLACED);
//!
//! #[derive(Debug)]
//! struct RushOrder { placed: OrderPlaced, deadline: u64 }
//! impl_message!(RushOrder, &RUSH_ORDER, base = placed);
//! ```

use std::any::Any;
use std::fmt;

use uuid::Uuid;

pub type MsgId = Uuid;

/// Dense integer id assigned by the [`MessageHierarchy`](crate::MessageHierarchy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MsgTypeId(pub usize);

impl MsgTypeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for MsgTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub fn new_msg_id() -> MsgId {
    Uuid::new_v4()
}

/// Static type tag of a message type. Names must be unique per process.
#[derive(Debug)]
pub struct MessageKind {
    name: &'static str,
    parent: Option<&'static MessageKind>,
}

impl MessageKind {
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    pub const fn derived(name: &'static str, parent: &'static MessageKind) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static MessageKind> {
        self.parent
    }

    /// This kind followed by its parent chain up to the root.
    pub fn lineage(&self) -> impl Iterator<Item = &MessageKind> {
        let mut next = Some(self);
        std::iter::from_fn(move || {
            let current = next?;
            next = current.parent.map(|parent| parent as &MessageKind);
            Some(current)
        })
    }

    /// True when `self` is `ancestor` or descends from it.
    pub fn is_a(&self, ancestor: &MessageKind) -> bool {
        self.lineage().any(|kind| kind == ancestor)
    }

    pub fn is_command(&self) -> bool {
        self.is_a(&COMMAND)
    }
}

impl PartialEq for MessageKind {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for MessageKind {}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub static MESSAGE: MessageKind = MessageKind::root("Message");
pub static COMMAND: MessageKind = MessageKind::derived("Command", &MESSAGE);
pub static ACK_COMMAND: MessageKind = MessageKind::derived("AckCommand", &MESSAGE);
pub static COMMAND_RESPONSE: MessageKind = MessageKind::derived("CommandResponse", &MESSAGE);

/// Upcasts implemented for every [`Message`]; lets erased messages be
/// downcast to their concrete type or re-borrowed as `dyn Message`.
pub trait MessageCast {
    fn as_any(&self) -> &dyn Any;
    fn as_message(&self) -> &(dyn Message + 'static);
}

impl<T: Message> MessageCast for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_message(&self) -> &(dyn Message + 'static) {
        self
    }
}

/// Unit of bus traffic. Immutable once published.
pub trait Message: MessageCast + Send + Sync + fmt::Debug + 'static {
    fn msg_id(&self) -> MsgId;
    fn kind(&self) -> &'static MessageKind;

    /// The value of this message viewed as `kind`: itself for its own kind,
    /// the embedded base value for an ancestor kind, `None` otherwise.
    fn upcast(&self, kind: &MessageKind) -> Option<&dyn Any> {
        (self.kind() == kind).then(|| self.as_any())
    }
}

/// A concrete message type that typed subscriptions can name.
pub trait MessageType: Message + Sized {
    fn message_kind() -> &'static MessageKind;
}

/// A message expecting exactly one handler to acknowledge and answer it.
/// Its kind must descend from [`COMMAND`].
pub trait Command: MessageType {}

/// Implements [`Message`] and [`MessageType`] for a struct.
///
/// `impl_message!(Ty, &KIND)` expects a `msg_id: MsgId` field.
/// `impl_message!(Ty, &KIND, base = field)` takes the id from the embedded
/// parent message in `field` and exposes it to ancestor subscriptions.
#[macro_export]
macro_rules! impl_message {
    ($ty:ty, $kind:expr) => {
        impl $crate::Message for $ty {
            fn msg_id(&self) -> $crate::MsgId {
                self.msg_id
            }

            fn kind(&self) -> &'static $crate::MessageKind {
                $kind
            }
        }

        impl $crate::MessageType for $ty {
            fn message_kind() -> &'static $crate::MessageKind {
                $kind
            }
        }
    };
    ($ty:ty, $kind:expr, base = $base:ident) => {
        impl $crate::Message for $ty {
            fn msg_id(&self) -> $crate::MsgId {
                $crate::Message::msg_id(&self.$base)
            }

            fn kind(&self) -> &'static $crate::MessageKind {
                $kind
            }

            fn upcast(&self, kind: &$crate::MessageKind) -> Option<&dyn ::std::any::Any> {
                if kind == <Self as $crate::Message>::kind(self) {
                    Some(self as &dyn ::std::any::Any)
                } else {
                    $crate::Message::upcast(&self.$base, kind)
                }
            }
        }

        impl $crate::MessageType for $ty {
            fn message_kind() -> &'static $crate::MessageKind {
                $kind
            }
        }
    };
}

/// [`impl_message!`] plus the [`Command`] marker.
#[macro_export]
macro_rules! impl_command {
    ($ty:ty, $kind:expr $(, base = $base:ident)?) => {
        $crate::impl_message!($ty, $kind $(, base = $base)?);

        impl $crate::Command for $ty {}
    };
}

/// Emitted by a handler that accepted responsibility for a command.
#[derive(Debug, Clone, PartialEq)]
pub struct AckCommand {
    msg_id: MsgId,
    command_id: MsgId,
    command_kind: &'static MessageKind,
}

impl_message!(AckCommand, &ACK_COMMAND);

impl AckCommand {
    pub fn new(command: &dyn Message) -> Self {
        Self {
            msg_id: new_msg_id(),
            command_id: command.msg_id(),
            command_kind: command.kind(),
        }
    }

    pub fn command_id(&self) -> MsgId {
        self.command_id
    }

    pub fn command_kind(&self) -> &'static MessageKind {
        self.command_kind
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseStatus {
    Success,
    Fail { reason: String },
}

/// Result of a command, correlated to the originating command id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    msg_id: MsgId,
    command_id: MsgId,
    command_kind: &'static MessageKind,
    status: ResponseStatus,
    payload: Option<serde_json::Value>,
}

impl_message!(CommandResponse, &COMMAND_RESPONSE);

impl CommandResponse {
    pub fn success(command: &dyn Message) -> Self {
        Self::with_status(command, ResponseStatus::Success)
    }

    pub fn fail(command: &dyn Message, reason: impl Into<String>) -> Self {
        Self::with_status(
            command,
            ResponseStatus::Fail {
                reason: reason.into(),
            },
        )
    }

    fn with_status(command: &dyn Message, status: ResponseStatus) -> Self {
        Self {
            msg_id: new_msg_id(),
            command_id: command.msg_id(),
            command_kind: command.kind(),
            status,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn command_id(&self) -> MsgId {
        self.command_id
    }

    pub fn command_kind(&self) -> &'static MessageKind {
        self.command_kind
    }

    pub fn status(&self) -> &ResponseStatus {
        &self.status
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ResponseStatus::Success)
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PING: MessageKind = MessageKind::derived("test.Ping", &COMMAND);
    static LOUD_PING: MessageKind = MessageKind::derived("test.LoudPing", &PING);

    #[derive(Debug)]
    struct Ping {
        msg_id: MsgId,
    }

    impl_command!(Ping, &PING);

    #[test]
    fn lineage_walks_to_root() {
        let names: Vec<_> = LOUD_PING.lineage().map(MessageKind::name).collect();
        assert_eq!(names, ["test.LoudPing", "test.Ping", "Command", "Message"]);
    }

    #[test]
    fn is_a_follows_parents_only() {
        assert!(LOUD_PING.is_a(&PING));
        assert!(LOUD_PING.is_a(&MESSAGE));
        assert!(!PING.is_a(&LOUD_PING));
        assert!(!ACK_COMMAND.is_a(&COMMAND));
        assert!(LOUD_PING.is_command());
        assert!(!COMMAND_RESPONSE.is_command());
    }

    #[test]
    fn responses_correlate_to_command() {
        let ping = Ping {
            msg_id: new_msg_id(),
        };
        let ack = AckCommand::new(&ping);
        assert_eq!(ack.command_id(), ping.msg_id());
        assert_eq!(ack.command_kind(), &PING);
        assert_ne!(ack.msg_id(), ping.msg_id());

        let response = CommandResponse::fail(&ping, "nope").with_payload(serde_json::json!(3));
        assert_eq!(response.command_id(), ping.msg_id());
        assert!(!response.is_success());
        assert_eq!(
            response.status(),
            &ResponseStatus::Fail {
                reason: "nope".into()
            }
        );
        assert_eq!(response.payload(), Some(&serde_json::json!(3)));
    }

    #[derive(Debug)]
    struct LoudPing {
        ping: Ping,
        volume: u8,
    }

    impl_command!(LoudPing, &LOUD_PING, base = ping);

    #[test]
    fn upcast_exposes_the_embedded_base() {
        let loud = LoudPing {
            ping: Ping {
                msg_id: new_msg_id(),
            },
            volume: 11,
        };
        let erased: &dyn Message = &loud;
        assert_eq!(erased.msg_id(), loud.ping.msg_id());

        let itself = erased.upcast(&LOUD_PING).expect("own kind");
        assert_eq!(itself.downcast_ref::<LoudPing>().map(|l| l.volume), Some(11));
        let base = erased.upcast(&PING).expect("base kind");
        assert!(base.downcast_ref::<Ping>().is_some());
        // abstract kinds have no concrete value to view
        assert!(erased.upcast(&COMMAND).is_none());
        assert!(erased.upcast(&ACK_COMMAND).is_none());
    }

    #[test]
    fn downcast_through_dyn_message() {
        let ping = Ping {
            msg_id: new_msg_id(),
        };
        let erased: &dyn Message = &ping;
        assert!(erased.as_any().downcast_ref::<Ping>().is_some());
        assert!(erased.as_any().downcast_ref::<AckCommand>().is_none());
    }
}
