//! `connection_pool` configuration for pre-established upstream sessions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The `connection_pool` block. All durations accept an integer number of
/// seconds or a string like `"90s"` / `"5m"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionPoolConfig {
    /// Target number of warm idle sessions; 0 disables pre-warming.
    #[serde(default)]
    pub ensure_idle_session: usize,
    /// New sessions created per maintenance tick while topping up.
    #[serde(default = "default_create_rate")]
    pub ensure_idle_session_create_rate: usize,
    /// Idle-timeout eviction never shrinks the idle set below this.
    #[serde(default)]
    pub min_idle_session: usize,
    /// Age eviction floor; 0 inherits `min_idle_session`.
    #[serde(default)]
    pub min_idle_session_for_age: usize,

    #[serde(
        default = "default_check_interval",
        with = "crate::de::duration"
    )]
    pub idle_session_check_interval: Duration,
    #[serde(default = "default_idle_timeout", with = "crate::de::duration")]
    pub idle_session_timeout: Duration,

    /// Rotation deadline per session; zero disables lifetime expiry.
    #[serde(default, with = "crate::de::duration")]
    pub max_connection_lifetime: Duration,
    /// Uniform +/- spread applied to each session's lifetime.
    #[serde(default, with = "crate::de::duration")]
    pub connection_lifetime_jitter: Duration,

    /// Read-deadline refresh period for idle sessions; zero disables.
    #[serde(default, with = "crate::de::duration")]
    pub heartbeat: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            ensure_idle_session: 0,
            ensure_idle_session_create_rate: default_create_rate(),
            min_idle_session: 0,
            min_idle_session_for_age: 0,
            idle_session_check_interval: default_check_interval(),
            idle_session_timeout: default_idle_timeout(),
            max_connection_lifetime: Duration::ZERO,
            connection_lifetime_jitter: Duration::ZERO,
            heartbeat: Duration::ZERO,
        }
    }
}

impl ConnectionPoolConfig {
    /// Age-eviction floor with the inherit-from-`min_idle_session` rule
    /// applied.
    pub fn effective_min_idle_for_age(&self) -> usize {
        if self.min_idle_session_for_age == 0 {
            self.min_idle_session
        } else {
            self.min_idle_session_for_age
        }
    }
}

fn default_create_rate() -> usize {
    1
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}
