//! Bounded fixed-delay reconnection policy for progress channels.
//!
//! When a channel drops without being closed on purpose, the client asks
//! [`next_attempt`] what to do. The decision is a pure function of how many
//! consecutive failures have been observed, so the policy is testable without
//! timers or network I/O.

use std::time::Duration;

/// Number of reconnect attempts before the channel is declared lost.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Delay before each reconnect attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Tunable parameters for the reconnect strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts allowed after the initial connection drops.
    pub max_attempts: u32,
    /// Fixed wait before every attempt.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// What the client should do after an unexpected close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait `delay`, then make reconnect attempt number `attempt` (1-based).
    Retry { attempt: u32, delay: Duration },
    /// The budget is spent; report the channel as lost.
    GiveUp,
}

/// Decide the next step given the number of consecutive failures.
///
/// `failures` counts the initial drop plus every failed reconnect attempt
/// since the channel was last confirmed connected. With the default policy
/// failures 1-3 yield attempts 1-3 and the 4th failure gives up.
pub fn next_attempt(failures: u32, policy: &ReconnectPolicy) -> ReconnectDecision {
    if failures == 0 || failures > policy.max_attempts {
        return ReconnectDecision::GiveUp;
    }
    ReconnectDecision::Retry {
        attempt: failures,
        delay: policy.delay,
    }
}
