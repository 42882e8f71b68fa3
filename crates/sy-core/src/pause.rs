//! Process-wide pause state consumed by background probers.

use std::sync::atomic::{AtomicBool, Ordering};

/// Anything that can report whether background work should pause
/// (typically wired to device sleep / network-down notifications).
pub trait PauseManager: Send + Sync {
    fn is_paused(&self) -> bool;
}

/// Default flag-based pause manager.
#[derive(Debug, Default)]
pub struct PauseController {
    paused: AtomicBool,
}

impl PauseController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }
}

impl PauseManager for PauseController {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}
