//! Cairn Storage - Cache Pools, Stores and Drivers
//!
//! Tag-aware hierarchical cache stores. A [`Store`] encodes keys and wraps
//! values; a [`CachePool`] per backend family does the I/O:
//! the filesystem engine in [`file`] and the key/value pool in [`kv`] over
//! memory, LMDB, redis or memcached connections.
//! [`build_store`] assembles a store from a [`cairn_core::StoreConfig`].

pub mod driver;
pub mod file;
pub mod kv;
pub mod lock;
pub mod pool;
pub mod store;
pub mod tag_index;
pub mod tag_scope;

pub use driver::{build_store, build_store_with_clock};
pub use file::{FileCachePool, FileLayout, FileLockBackend};
pub use kv::{
    ConnectionCapabilities, HierarchyKey, InMemoryConnection, KvCachePool, KvConnection,
    KvHierarchy, KvLockBackend, LmdbConnection,
};
pub use lock::{CacheLock, LockBackend, DEFAULT_RETRY_INTERVAL};
pub use pool::{CachePool, Capabilities, DeferredQueue};
pub use store::{CacheStats, Store};
pub use tag_index::{tag_list_key, TagIndex, TagListStore};
pub use tag_scope::{PendingTags, TagScope};

#[cfg(feature = "memcached")]
pub use kv::MemcachedConnection;
#[cfg(feature = "redis")]
pub use kv::RedisConnection;
