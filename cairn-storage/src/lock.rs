//! Named leases.
//!
//! A [`CacheLock`] is a handle on one named lease held in a backend. The
//! backend only provides single-attempt primitives; retrying and timeouts
//! live in the handle.
//!
//! # State Transition Diagram
//!
//! ```text
//! (free) ─── acquire() / block() ──→ held by owner ─── release() ──→ (free)
//!                                        │
//!                                  ttl elapsed ──→ (free, next acquirer takes over)
//!                                        │
//!                                  force_release() ──→ (free)
//! ```
//!
//! Handles compare owner tokens, so a handle rebuilt from the same token in
//! another process can release a lease it did not acquire.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cairn_core::{new_owner_token, CairnResult, LockError};
use tracing::{debug, warn};

/// Default pause between attempts in [`CacheLock::block`].
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Single-attempt lease primitives.
pub trait LockBackend: Send + Sync + fmt::Debug {
    fn backend_name(&self) -> &'static str;

    /// Take the lease if it is free. `ttl = None` never expires.
    fn try_acquire(&self, name: &str, owner: &str, ttl: Option<Duration>) -> CairnResult<bool>;

    /// Free the lease if `owner` holds it.
    fn release(&self, name: &str, owner: &str) -> CairnResult<bool>;

    /// Free the lease whoever holds it.
    fn force_release(&self, name: &str) -> CairnResult<()>;

    fn current_owner(&self, name: &str) -> CairnResult<Option<String>>;
}

/// Handle on one named lease.
#[derive(Debug, Clone)]
pub struct CacheLock {
    backend: Arc<dyn LockBackend>,
    name: String,
    owner: String,
    ttl: Option<Duration>,
    retry_interval: Duration,
}

impl CacheLock {
    /// Build a handle; `ttl` of zero never expires and a missing owner gets a
    /// fresh token. Nothing is acquired yet.
    pub fn new(
        backend: Arc<dyn LockBackend>,
        name: impl Into<String>,
        ttl: Duration,
        owner: Option<String>,
    ) -> Self {
        Self {
            backend,
            name: name.into(),
            owner: owner.unwrap_or_else(new_owner_token),
            ttl: (!ttl.is_zero()).then_some(ttl),
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// One attempt.
    pub fn acquire(&self) -> CairnResult<bool> {
        let acquired = self.backend.try_acquire(&self.name, &self.owner, self.ttl)?;
        debug!(lock = %self.name, owner = %self.owner, acquired, "lock attempt");
        Ok(acquired)
    }

    /// Retry every `retry_interval` until the lease is taken or `timeout` elapses.
    pub fn block(&self, timeout: Duration) -> CairnResult<()> {
        let started = Instant::now();
        loop {
            if self.acquire()? {
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                let waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX);
                warn!(lock = %self.name, waited_ms, "lock wait timed out");
                return Err(LockError::Timeout {
                    name: self.name.clone(),
                    waited_ms,
                }
                .into());
            }
            thread::sleep(self.retry_interval.min(timeout - waited));
        }
    }

    /// Release if this handle's owner holds the lease.
    pub fn release(&self) -> CairnResult<bool> {
        let released = self.backend.release(&self.name, &self.owner)?;
        debug!(lock = %self.name, owner = %self.owner, released, "lock release");
        Ok(released)
    }

    pub fn force_release(&self) -> CairnResult<()> {
        self.backend.force_release(&self.name)?;
        debug!(lock = %self.name, "lock force released");
        Ok(())
    }

    pub fn is_owned_by_current_process(&self) -> CairnResult<bool> {
        Ok(self.backend.current_owner(&self.name)?.as_deref() == Some(self.owner.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Leases without expiry, enough to drive the handle.
    #[derive(Debug, Default)]
    struct TableLocks {
        held: Mutex<HashMap<String, String>>,
    }

    impl LockBackend for TableLocks {
        fn backend_name(&self) -> &'static str {
            "table"
        }

        fn try_acquire(&self, name: &str, owner: &str, _ttl: Option<Duration>) -> CairnResult<bool> {
            let mut held = self.held.lock().unwrap();
            if held.contains_key(name) {
                return Ok(false);
            }
            held.insert(name.to_string(), owner.to_string());
            Ok(true)
        }

        fn release(&self, name: &str, owner: &str) -> CairnResult<bool> {
            let mut held = self.held.lock().unwrap();
            if held.get(name).map(String::as_str) == Some(owner) {
                held.remove(name);
                return Ok(true);
            }
            Ok(false)
        }

        fn force_release(&self, name: &str) -> CairnResult<()> {
            self.held.lock().unwrap().remove(name);
            Ok(())
        }

        fn current_owner(&self, name: &str) -> CairnResult<Option<String>> {
            Ok(self.held.lock().unwrap().get(name).cloned())
        }
    }

    fn backend() -> Arc<dyn LockBackend> {
        Arc::new(TableLocks::default())
    }

    #[test]
    fn test_acquire_and_release() {
        let backend = backend();
        let lock = CacheLock::new(backend.clone(), "job", Duration::from_secs(10), None);
        assert!(lock.acquire().unwrap());
        assert!(lock.is_owned_by_current_process().unwrap());

        let other = CacheLock::new(backend, "job", Duration::from_secs(10), None);
        assert!(!other.acquire().unwrap());
        assert!(!other.release().unwrap());

        assert!(lock.release().unwrap());
        assert!(other.acquire().unwrap());
    }

    #[test]
    fn test_restored_handle_releases() {
        let backend = backend();
        let lock = CacheLock::new(backend.clone(), "job", Duration::ZERO, Some("owner-1".into()));
        assert!(lock.acquire().unwrap());

        let restored = CacheLock::new(backend, "job", Duration::ZERO, Some("owner-1".into()));
        assert_eq!(restored.owner(), "owner-1");
        assert!(restored.release().unwrap());
    }

    #[test]
    fn test_block_times_out() {
        let backend = backend();
        let holder = CacheLock::new(backend.clone(), "job", Duration::ZERO, None);
        assert!(holder.acquire().unwrap());

        let waiter = CacheLock::new(backend, "job", Duration::ZERO, None)
            .with_retry_interval(Duration::from_millis(5));
        let err = waiter.block(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(
            err,
            cairn_core::CairnError::Lock(LockError::Timeout { .. })
        ));
    }

    #[test]
    fn test_force_release() {
        let backend = backend();
        let holder = CacheLock::new(backend.clone(), "job", Duration::ZERO, None);
        assert!(holder.acquire().unwrap());

        let other = CacheLock::new(backend, "job", Duration::ZERO, None);
        other.force_release().unwrap();
        assert!(!holder.is_owned_by_current_process().unwrap());
        assert!(other.acquire().unwrap());
    }

    #[test]
    fn test_generated_owners_differ() {
        let backend = backend();
        let a = CacheLock::new(backend.clone(), "job", Duration::ZERO, None);
        let b = CacheLock::new(backend, "job", Duration::ZERO, None);
        assert_ne!(a.owner(), b.owner());
    }
}
