//! In-process publish/subscribe over a runtime message type hierarchy, with
//! tracked single-handler commands.
//!
//! - [`MessageBus`] fans a published message out to every handler
//!   subscribed for its type or one of its ancestors.
//! - [`Dispatcher`] adds commands: one handler acknowledges and answers, and
//!   the caller gets a [`PendingCommand`] resolving to the response or to a
//!   [`CommandError`].

mod bus;
mod config;
mod dispatcher;
mod error;
mod handler;
mod hierarchy;
mod message;
pub mod telemetry;
mod tracker;

pub use bus::MessageBus;
pub use config::{
    BusConfig, CommandTimeouts, DispatcherConfig, DEFAULT_ACK_TIMEOUT, DEFAULT_RESPONSE_TIMEOUT,
    DEFAULT_SLOW_MESSAGE_THRESHOLD, DEFAULT_VERY_SLOW_MESSAGE_THRESHOLD,
};
pub use dispatcher::{CommandBus, CommandSubscriber, Dispatcher, HandleCommand};
pub use error::{BusError, BusResult, CommandError, CommandResult};
pub use handler::{Handle, HandlerId, Publisher, Subscribable, Subscriber, Subscription};
pub use hierarchy::{MessageHierarchy, ObserverId};
pub use message::{
    new_msg_id, AckCommand, Command, CommandResponse, Message, MessageCast, MessageKind,
    MessageType, MsgId, MsgTypeId, ResponseStatus, ACK_COMMAND, COMMAND, COMMAND_RESPONSE,
    MESSAGE,
};
pub use telemetry::DispatchStats;
pub use tracker::{CommandTracker, PendingCommand, TrackerState};
