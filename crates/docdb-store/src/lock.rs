use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Compatible with other row-share holders.
    RowShare,
    Exclusive,
}

#[derive(Debug, Default)]
struct Held {
    shared: usize,
    exclusive: bool,
}

impl Held {
    fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::RowShare => !self.exclusive,
            LockMode::Exclusive => !self.exclusive && self.shared == 0,
        }
    }

    fn acquire(&mut self, mode: LockMode) {
        match mode {
            LockMode::RowShare => self.shared += 1,
            LockMode::Exclusive => self.exclusive = true,
        }
    }
}

/// Named table locks.
#[derive(Debug, Default)]
pub struct LockManager {
    held: Mutex<HashMap<String, Held>>,
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, HashMap<String, Held>>, StoreError> {
        self.held.lock().map_err(|_| StoreError::poisoned("table lock"))
    }

    /// Take the lock only if nobody holds a conflicting one.
    pub fn try_lock(&self, name: &str, mode: LockMode) -> Result<LockGuard<'_>, StoreError> {
        let mut held = self.state()?;
        let entry = held.entry(name.to_string()).or_default();
        if !entry.admits(mode) {
            return Err(StoreError::LockNotAvailable(name.to_string()));
        }
        entry.acquire(mode);
        trace!(table = name, ?mode, "lock acquired");
        Ok(LockGuard {
            manager: self,
            name: name.to_string(),
            mode,
        })
    }

    /// Wait up to `timeout` for the lock.
    pub fn lock_timeout(
        &self,
        name: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGuard<'_>, StoreError> {
        let deadline = Instant::now() + timeout;
        let mut held = self.state()?;
        loop {
            let entry = held.entry(name.to_string()).or_default();
            if entry.admits(mode) {
                entry.acquire(mode);
                trace!(table = name, ?mode, "lock acquired");
                return Ok(LockGuard {
                    manager: self,
                    name: name.to_string(),
                    mode,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockNotAvailable(name.to_string()));
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .map_err(|_| StoreError::poisoned("table lock"))?;
            held = guard;
        }
    }

    fn release(&self, name: &str, mode: LockMode) {
        // a poisoned map has nothing left worth releasing
        let Ok(mut held) = self.held.lock() else {
            return;
        };
        if let Some(entry) = held.get_mut(name) {
            match mode {
                LockMode::RowShare => entry.shared = entry.shared.saturating_sub(1),
                LockMode::Exclusive => entry.exclusive = false,
            }
            if entry.shared == 0 && !entry.exclusive {
                held.remove(name);
            }
        }
        self.released.notify_all();
    }
}

/// Releases its lock on drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    name: String,
    mode: LockMode,
}

impl LockGuard<'_> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(&self.name, self.mode);
    }
}
