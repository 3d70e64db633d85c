//! Key/value drivers.
//!
//! Every key/value backend is wrapped in a [`KvConnection`], a small
//! synchronous client surface. [`KvCachePool`] builds hierarchy and tags on
//! top of it, and [`KvLockBackend`] builds leases.
//!
//! Values are opaque bytes. Records are JSON, hierarchy indexes are decimal
//! ASCII so backends with native counters can increment them in place.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use cairn_core::{BackendError, CairnResult};

use crate::tag_index::push_unique;

pub mod hierarchy;
pub mod lmdb;
pub mod lock;
pub mod memory;
pub mod pool;

#[cfg(feature = "memcached")]
pub mod memcached_connection;
#[cfg(feature = "redis")]
pub mod redis_connection;

pub use hierarchy::{HierarchyKey, KvHierarchy};
pub use lmdb::LmdbConnection;
pub use lock::KvLockBackend;
pub use memory::InMemoryConnection;
pub use pool::KvCachePool;

#[cfg(feature = "memcached")]
pub use memcached_connection::MemcachedConnection;
#[cfg(feature = "redis")]
pub use redis_connection::RedisConnection;

bitflags! {
    /// Primitives a connection performs atomically on the server side.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConnectionCapabilities: u8 {
        /// `add` is set-if-absent in one step
        const ATOMIC_ADD = 0b0000_0001;
        /// `delete_many` is one command
        const BULK_DELETE = 0b0000_0010;
        /// list operations are server-side lists
        const NATIVE_LISTS = 0b0000_0100;
        /// `delete_if_equals` is one step
        const COMPARE_AND_DELETE = 0b0000_1000;
    }
}

/// Synchronous key/value client.
pub trait KvConnection: Send + Sync + fmt::Debug {
    fn backend_name(&self) -> &'static str;

    fn capabilities(&self) -> ConnectionCapabilities;

    fn get(&self, key: &str) -> CairnResult<Option<Vec<u8>>>;

    /// `ttl = None` never expires.
    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<()>;

    /// Set only if absent; returns whether the value was written.
    fn add(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CairnResult<bool>;

    fn delete(&self, key: &str) -> CairnResult<bool>;

    /// Add `by` to a decimal counter, creating it from zero.
    fn increment(&self, key: &str, by: i64) -> CairnResult<i64>;

    /// Remove every key the connection can see.
    fn flush(&self) -> CairnResult<()>;

    fn delete_many(&self, keys: &[String]) -> CairnResult<usize> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete `key` only while it holds `expected`.
    fn delete_if_equals(&self, key: &str, expected: &[u8]) -> CairnResult<bool> {
        match self.get(key)? {
            Some(current) if current == expected => self.delete(key),
            _ => Ok(false),
        }
    }

    fn list_range(&self, key: &str) -> CairnResult<Vec<String>> {
        match self.get(key)? {
            Some(bytes) => decode_list(key, &bytes),
            None => Ok(Vec::new()),
        }
    }

    /// Append `member`; read-modify-write lists skip members already present.
    fn list_push(&self, key: &str, member: &str) -> CairnResult<()> {
        let mut list = self.list_range(key)?;
        if push_unique(&mut list, member) {
            self.set(key, &serde_json::to_vec(&list)?, None)?;
        }
        Ok(())
    }

    fn list_remove(&self, key: &str, member: &str) -> CairnResult<()> {
        let mut list = self.list_range(key)?;
        let before = list.len();
        list.retain(|m| m != member);
        if list.len() != before {
            self.set(key, &serde_json::to_vec(&list)?, None)?;
        }
        Ok(())
    }
}

pub(crate) fn decode_list(key: &str, bytes: &[u8]) -> CairnResult<Vec<String>> {
    serde_json::from_slice(bytes).map_err(|e| BackendError::corrupt(key, e).into())
}

/// Parse a decimal counter value.
pub(crate) fn decode_counter(key: &str, bytes: &[u8]) -> CairnResult<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| BackendError::corrupt(key, "counter is not a decimal integer").into())
}
