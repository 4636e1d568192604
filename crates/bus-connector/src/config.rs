use std::env;

pub const DEFAULT_TRACKED_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Upper bound on each adapter's tracked-id set.
    pub tracked_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tracked_capacity: DEFAULT_TRACKED_CAPACITY,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let tracked_capacity = lookup("BUS_BRIDGE_TRACKED_CAPACITY")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|capacity| *capacity > 0)
            .unwrap_or(DEFAULT_TRACKED_CAPACITY);
        Self { tracked_capacity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_override() {
        let config = BridgeConfig::from_lookup(|name| {
            (name == "BUS_BRIDGE_TRACKED_CAPACITY").then(|| "128".to_string())
        });
        assert_eq!(config.tracked_capacity, 128);
    }

    #[test]
    fn zero_or_garbage_keeps_default() {
        for value in ["0", "lots", ""] {
            let config = BridgeConfig::from_lookup(|_| Some(value.to_string()));
            assert_eq!(config, BridgeConfig::default());
        }
    }
}
