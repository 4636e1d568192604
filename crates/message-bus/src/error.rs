use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus '{bus}' has been disposed")]
    Disposed { bus: String },
    #[error("bus configuration error: {0}")]
    Configuration(String),
    #[error("command {command} already has a registered handler")]
    DuplicateCommandHandler { command: &'static str },
    #[error("{kind} is not a command")]
    NotACommand { kind: &'static str },
}

pub type BusResult<T> = Result<T, BusError>;

/// Terminal failure of a tracked command, delivered through its
/// [`PendingCommand`](crate::PendingCommand) rather than the dispatch call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{command} not handled: timed out waiting for a handler to start")]
    NotHandled { command: &'static str },
    #[error("{command} timed out waiting for its handler to complete")]
    TimedOut { command: &'static str },
    #[error("{command} oversubscribed: multiple handlers acknowledged the command")]
    Oversubscribed { command: &'static str },
    #[error("{command} tracking was cancelled before an outcome was reached")]
    Cancelled { command: &'static str },
}

impl CommandError {
    pub fn command(&self) -> &'static str {
        match self {
            CommandError::NotHandled { command }
            | CommandError::TimedOut { command }
            | CommandError::Oversubscribed { command }
            | CommandError::Cancelled { command } => command,
        }
    }
}

pub type CommandResult = Result<crate::CommandResponse, CommandError>;
