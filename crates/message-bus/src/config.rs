use std::env;
use std::time::Duration;

pub const DEFAULT_SLOW_MESSAGE_THRESHOLD: Duration = Duration::from_millis(48);
pub const DEFAULT_VERY_SLOW_MESSAGE_THRESHOLD: Duration = Duration::from_secs(7);
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(2_000);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Dispatch timing watch for a [`MessageBus`](crate::MessageBus).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    pub watch_slow: bool,
    pub slow_threshold: Duration,
    pub very_slow_threshold: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            watch_slow: true,
            slow_threshold: DEFAULT_SLOW_MESSAGE_THRESHOLD,
            very_slow_threshold: DEFAULT_VERY_SLOW_MESSAGE_THRESHOLD,
        }
    }
}

impl BusConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            watch_slow: flag(&lookup, "MESSAGE_BUS_WATCH_SLOW").unwrap_or(defaults.watch_slow),
            slow_threshold: millis(&lookup, "MESSAGE_BUS_SLOW_MS")
                .unwrap_or(defaults.slow_threshold),
            very_slow_threshold: millis(&lookup, "MESSAGE_BUS_VERY_SLOW_MS")
                .unwrap_or(defaults.very_slow_threshold),
        }
    }
}

/// Ack and response windows for tracked commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTimeouts {
    pub ack_timeout: Duration,
    pub response_timeout: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl CommandTimeouts {
    pub fn new(ack_timeout: Duration, response_timeout: Duration) -> Self {
        Self {
            ack_timeout,
            response_timeout,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            ack_timeout: millis(&lookup, "MESSAGE_BUS_ACK_TIMEOUT_MS")
                .unwrap_or(defaults.ack_timeout),
            response_timeout: millis(&lookup, "MESSAGE_BUS_RESPONSE_TIMEOUT_MS")
                .unwrap_or(defaults.response_timeout),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub bus: BusConfig,
    pub timeouts: CommandTimeouts,
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        Self {
            bus: BusConfig::from_env(),
            timeouts: CommandTimeouts::from_env(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: CommandTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    lookup(name).map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
