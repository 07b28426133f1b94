//! In-process named locks.
//!
//! Used to keep a single logical worker per workflow task and a single writer
//! per deployment environment. Acquisition never blocks: a second caller gets
//! `None` and reports the resource as busy.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

/// A set of currently held lock names.
#[derive(Debug, Default, Clone)]
pub struct NamedLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|poisoned| {
            warn!("named lock table was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Try to take the lock called `name`. Returns `None` if it is held.
    pub fn try_acquire(&self, name: &str) -> Option<NamedLockGuard> {
        if !self.held().insert(name.to_string()) {
            debug!(lock = name, "lock is already held");
            return None;
        }
        debug!(lock = name, "lock acquired");
        Some(NamedLockGuard {
            locks: self.clone(),
            name: name.to_string(),
        })
    }

    /// Whether the lock called `name` is currently held.
    pub fn is_held(&self, name: &str) -> bool {
        self.held().contains(name)
    }
}

/// RAII guard that releases its named lock on drop, even on panic.
#[derive(Debug)]
pub struct NamedLockGuard {
    locks: NamedLocks,
    name: String,
}

impl Drop for NamedLockGuard {
    fn drop(&mut self) {
        self.locks.held().remove(&self.name);
        debug!(lock = %self.name, "lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_until_release() {
        let locks = NamedLocks::new();
        let guard = locks.try_acquire("production").unwrap();
        assert!(locks.try_acquire("production").is_none());
        assert!(locks.try_acquire("staging").is_some());
        assert!(locks.is_held("production"));

        drop(guard);
        assert!(!locks.is_held("production"));
        assert!(locks.try_acquire("production").is_some());
    }

    #[test]
    fn test_clones_share_state() {
        let locks = NamedLocks::new();
        let other = locks.clone();
        let _guard = locks.try_acquire("task_1").unwrap();
        assert!(other.try_acquire("task_1").is_none());
    }
}
