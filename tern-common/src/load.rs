//! Load based admission and queueing decisions.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

const fn default_queue_la() -> u32 {
    8
}

const fn default_refuse_la() -> u32 {
    12
}

const fn default_queue_factor() -> u64 {
    600_000
}

/// What to do with an envelope once the server has accepted it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Deliver before answering the final `.`
    Interactive,
    /// Persist, answer, then deliver in the background
    #[default]
    Background,
    /// Persist only; a queue runner delivers later
    QueueOnly,
    /// Like `QueueOnly`, but without even resolving destinations
    Deferred,
}

impl DeliveryMode {
    pub const fn delivers_now(self) -> bool {
        matches!(self, Self::Interactive | Self::Background)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadPolicy {
    /// Load average at which low priority messages start being queued
    #[serde(default = "default_queue_la")]
    pub queue_la: u32,
    /// Load average at which new connections are refused
    #[serde(default = "default_refuse_la")]
    pub refuse_la: u32,
    #[serde(default = "default_queue_factor")]
    pub queue_factor: u64,
    /// Maximum new connections per second (`0` disables the throttle)
    #[serde(default)]
    pub connection_rate: u32,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self {
            queue_la: default_queue_la(),
            refuse_la: default_refuse_la(),
            queue_factor: default_queue_factor(),
            connection_rate: 0,
        }
    }
}

impl LoadPolicy {
    /// Whether a message of the given priority should be queued instead of
    /// delivered immediately. Larger priority values are less urgent.
    pub fn should_queue(&self, priority: u64, load: u32) -> bool {
        if load < self.queue_la {
            return false;
        }

        let divisor = u64::from(load - self.queue_la) + 1;
        priority > self.queue_factor / divisor
    }

    /// Whether the listener should turn away a connection right now
    pub const fn refuse_connections(&self, load: u32, rate: u32) -> bool {
        load >= self.refuse_la || (self.connection_rate > 0 && rate > self.connection_rate)
    }
}

/// Counts connections accepted in the current one second window
#[derive(Debug)]
pub struct ConnectionRate {
    window: Mutex<(Instant, u32)>,
}

impl Default for ConnectionRate {
    fn default() -> Self {
        Self {
            window: Mutex::new((Instant::now(), 0)),
        }
    }
}

impl ConnectionRate {
    /// Records a connection and returns the count for the current window
    pub fn record(&self) -> u32 {
        let mut window = self.window.lock();
        if window.0.elapsed() >= Duration::from_secs(1) {
            *window = (Instant::now(), 0);
        }
        window.1 = window.1.saturating_add(1);
        window.1
    }
}

/// Source of the current system load
pub trait LoadSource: Send + Sync {
    fn load(&self) -> u32;
}

/// Reports a fixed load
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedLoad(pub u32);

impl LoadSource for FixedLoad {
    fn load(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queueing_scales_with_load() {
        let policy = LoadPolicy {
            queue_la: 4,
            queue_factor: 1000,
            ..LoadPolicy::default()
        };

        assert!(!policy.should_queue(u64::MAX, 3));
        // At the threshold, anything above the full factor is queued
        assert!(policy.should_queue(1001, 4));
        assert!(!policy.should_queue(1000, 4));
        // Two over the threshold divides the factor by three
        assert!(policy.should_queue(334, 6));
        assert!(!policy.should_queue(333, 6));
    }

    #[test]
    fn refusal() {
        let policy = LoadPolicy {
            refuse_la: 10,
            connection_rate: 5,
            ..LoadPolicy::default()
        };

        assert!(policy.refuse_connections(10, 0));
        assert!(policy.refuse_connections(0, 6));
        assert!(!policy.refuse_connections(9, 5));
    }

    #[test]
    fn rate_window() {
        let rate = ConnectionRate::default();
        assert_eq!(rate.record(), 1);
        assert_eq!(rate.record(), 2);
    }
}
