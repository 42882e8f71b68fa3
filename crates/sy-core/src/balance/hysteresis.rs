//! Tier selection with flap damping.
//!
//! The active tier only leaves `Primary` after `primary_failures`
//! consecutive probe rounds with no primary candidate, and only returns to
//! `Primary` after the backup tier has been held for `backup_hold_time`.

use std::fmt;
use std::time::Instant;
use sy_config::HysteresisConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Backup,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Primary => f.write_str("primary"),
            Tier::Backup => f.write_str("backup"),
        }
    }
}

/// Hysteresis state, advanced once per probe round by [`step`].
#[derive(Debug, Clone)]
pub struct TierState {
    pub active_tier: Tier,
    pub primary_failure_count: u32,
    pub backup_activated_at: Option<Instant>,
}

impl TierState {
    pub fn new() -> Self {
        Self {
            active_tier: Tier::Primary,
            primary_failure_count: 0,
            backup_activated_at: None,
        }
    }
}

impl Default for TierState {
    fn default() -> Self {
        Self::new()
    }
}

/// Advance the FSM one observation. The failure counter saturates at the
/// threshold while no backup is available, so a later backup recovery
/// switches immediately.
pub fn step(
    current: &TierState,
    primary_available: bool,
    backup_available: bool,
    now: Instant,
    config: &HysteresisConfig,
) -> TierState {
    let mut next = current.clone();

    match current.active_tier {
        Tier::Primary => {
            if primary_available {
                next.primary_failure_count = 0;
            } else {
                next.primary_failure_count =
                    (current.primary_failure_count + 1).min(config.primary_failures);
                tracing::debug!(
                    failures = next.primary_failure_count,
                    threshold = config.primary_failures,
                    "primary tier failure"
                );
                if next.primary_failure_count >= config.primary_failures {
                    if backup_available {
                        next.active_tier = Tier::Backup;
                        next.backup_activated_at = Some(now);
                        next.primary_failure_count = 0;
                        tracing::warn!(
                            threshold = config.primary_failures,
                            "switching to backup tier"
                        );
                    } else {
                        tracing::error!("primary tier failed but no backup candidates available");
                    }
                }
            }
        }
        Tier::Backup => {
            if primary_available {
                let held_long_enough = current
                    .backup_activated_at
                    .map(|activated| {
                        now.saturating_duration_since(activated) >= config.backup_hold_time
                    })
                    .unwrap_or(true);
                if held_long_enough {
                    next.active_tier = Tier::Primary;
                    next.primary_failure_count = 0;
                    next.backup_activated_at = None;
                    tracing::info!("switching back to primary tier after hold time");
                } else {
                    tracing::debug!("primary tier recovered but backup hold time not elapsed");
                }
            } else if !backup_available {
                tracing::error!("backup tier failed and primary tier still unavailable");
            }
        }
    }

    next
}
