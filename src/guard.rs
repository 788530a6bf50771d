//! Per-site re-entrancy guard.
//!
//! Each site carries one guard per long-running operation. A caller that
//! cannot take the guard immediately skips its run instead of waiting.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default, Clone)]
pub struct SiteGuard {
    lock: Arc<Mutex<()>>,
}

/// Held for the duration of one run; released on drop, including on error.
pub type Running = OwnedMutexGuard<()>;

impl SiteGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<Running> {
        self.lock.clone().try_lock_owned().ok()
    }

    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}
