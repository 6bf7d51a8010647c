//! Delivery policy configuration.
//!
//! Per-tier send budgets applied by [`crate::job::Job::broadcast`] when a
//! subscriber's mailbox is full, plus the mailbox capacity itself and the
//! grace period granted to a producer after cancellation.

use std::time::Duration;

use relay_core::Priority;
use serde::{Deserialize, Serialize};

/// Tunable delivery parameters, shared by every job an engine creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Bounded mailbox slots per subscriber.
    pub mailbox_capacity: usize,
    /// Send budget for critical events before the async retry kicks in.
    pub critical_send_timeout_ms: u64,
    /// Send budget for high-priority events.
    pub high_send_timeout_ms: u64,
    /// Send budget for medium-priority events.
    pub medium_send_timeout_ms: u64,
    /// Send budget for low-priority events.
    pub low_send_timeout_ms: u64,
    /// How long eviction waits for a cancelled producer before proceeding.
    pub cancel_grace_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            critical_send_timeout_ms: 15_000,
            high_send_timeout_ms: 5_000,
            medium_send_timeout_ms: 3_000,
            low_send_timeout_ms: 2_000,
            cancel_grace_ms: 5_000,
        }
    }
}

impl DeliveryConfig {
    /// Effective mailbox capacity (never zero).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mailbox_capacity.max(1)
    }

    /// Send budget for the given priority tier.
    #[must_use]
    pub fn send_timeout(&self, priority: Priority) -> Duration {
        let ms = match priority {
            Priority::Critical => self.critical_send_timeout_ms,
            Priority::High => self.high_send_timeout_ms,
            Priority::Medium => self.medium_send_timeout_ms,
            Priority::Low => self.low_send_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Grace period before a cancelled producer is abandoned.
    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
