//! Leases stored as plain keys holding the owner token.

use std::sync::Arc;
use std::time::Duration;

use cairn_core::CairnResult;

use super::KvConnection;
use crate::lock::LockBackend;

/// [`LockBackend`] over `add` and `delete_if_equals`.
///
/// Lease expiry is the key's native TTL, so an abandoned lease disappears on
/// its own.
#[derive(Debug, Clone)]
pub struct KvLockBackend {
    conn: Arc<dyn KvConnection>,
}

impl KvLockBackend {
    pub fn new(conn: Arc<dyn KvConnection>) -> Self {
        Self { conn }
    }
}

impl LockBackend for KvLockBackend {
    fn backend_name(&self) -> &'static str {
        self.conn.backend_name()
    }

    fn try_acquire(&self, name: &str, owner: &str, ttl: Option<Duration>) -> CairnResult<bool> {
        self.conn.add(name, owner.as_bytes(), ttl)
    }

    fn release(&self, name: &str, owner: &str) -> CairnResult<bool> {
        self.conn.delete_if_equals(name, owner.as_bytes())
    }

    fn force_release(&self, name: &str) -> CairnResult<()> {
        self.conn.delete(name).map(|_| ())
    }

    fn current_owner(&self, name: &str) -> CairnResult<Option<String>> {
        Ok(self
            .conn
            .get(name)?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }
}
