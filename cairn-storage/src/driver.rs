//! Store construction from configuration.

use std::path::Path;
use std::sync::Arc;

use cairn_core::{
    CairnResult, Clock, ConfigError, Driver, KeyCodec, StoreConfig, SystemClock,
};
use tracing::info;

use crate::file::{FileCachePool, FileLayout, FileLockBackend};
use crate::kv::{InMemoryConnection, KvCachePool, KvConnection, KvLockBackend, LmdbConnection};
use crate::lock::LockBackend;
use crate::pool::CachePool;
use crate::store::Store;

/// Build a store for `config` on the system clock.
pub fn build_store(config: &StoreConfig) -> CairnResult<Store> {
    build_store_with_clock(config, Arc::new(SystemClock))
}

/// Build a store for `config` with an explicit time source.
pub fn build_store_with_clock(config: &StoreConfig, clock: Arc<dyn Clock>) -> CairnResult<Store> {
    config.validate()?;
    let codec = KeyCodec::new(config.driver.key_rules(), &config.prefix);

    let (pool, locker): (Arc<dyn CachePool>, Arc<dyn LockBackend>) = match config.driver {
        Driver::Memory => kv_parts(Arc::new(InMemoryConnection::new(clock.clone())), &clock),
        Driver::Lmdb => {
            let path = required_path(config)?;
            let conn = LmdbConnection::open(path, config.lmdb_map_size_mb, clock.clone())?;
            kv_parts(Arc::new(conn), &clock)
        }
        Driver::File | Driver::HierarchialFile => {
            let path = required_path(config)?;
            let layout = if config.driver == Driver::File {
                FileLayout::Flat
            } else {
                FileLayout::Hierarchical
            };
            let pool: Arc<dyn CachePool> = Arc::new(FileCachePool::open(
                path,
                layout,
                config.permissions,
                clock.clone(),
            )?);
            let locks: Arc<dyn LockBackend> =
                Arc::new(FileLockBackend::open(path, config.permissions, clock.clone())?);
            (pool, locks)
        }
        Driver::Redis => kv_parts(open_redis(config)?, &clock),
        Driver::Memcached => kv_parts(open_memcached(config, &clock)?, &clock),
    };

    let mut store = Store::new(pool, codec, clock).with_default_ttl(config.default_ttl());
    if config.lock.enabled {
        store = store.with_locker(locker, config.lock);
    }
    info!(
        driver = %config.driver,
        prefix = %store.prefix(),
        locks = config.lock.enabled,
        "cache store ready"
    );
    Ok(store)
}

fn kv_parts(
    conn: Arc<dyn KvConnection>,
    clock: &Arc<dyn Clock>,
) -> (Arc<dyn CachePool>, Arc<dyn LockBackend>) {
    (
        Arc::new(KvCachePool::new(conn.clone(), clock.clone())),
        Arc::new(KvLockBackend::new(conn)),
    )
}

fn required_path(config: &StoreConfig) -> CairnResult<&Path> {
    config.path.as_deref().ok_or_else(|| {
        ConfigError::MissingRequired {
            field: "path".to_string(),
        }
        .into()
    })
}

fn required_connection(config: &StoreConfig) -> CairnResult<&str> {
    config.connection.as_deref().ok_or_else(|| {
        ConfigError::MissingRequired {
            field: "connection".to_string(),
        }
        .into()
    })
}

#[cfg(feature = "redis")]
fn open_redis(config: &StoreConfig) -> CairnResult<Arc<dyn KvConnection>> {
    let url = required_connection(config)?;
    Ok(Arc::new(crate::kv::RedisConnection::open(url)?))
}

#[cfg(not(feature = "redis"))]
fn open_redis(config: &StoreConfig) -> CairnResult<Arc<dyn KvConnection>> {
    required_connection(config)?;
    Err(ConfigError::DriverNotSupported {
        driver: config.driver.to_string(),
    }
    .into())
}

#[cfg(feature = "memcached")]
fn open_memcached(
    config: &StoreConfig,
    clock: &Arc<dyn Clock>,
) -> CairnResult<Arc<dyn KvConnection>> {
    let url = required_connection(config)?;
    Ok(Arc::new(crate::kv::MemcachedConnection::open(
        url,
        clock.clone(),
    )?))
}

#[cfg(not(feature = "memcached"))]
fn open_memcached(
    config: &StoreConfig,
    _clock: &Arc<dyn Clock>,
) -> CairnResult<Arc<dyn KvConnection>> {
    required_connection(config)?;
    Err(ConfigError::DriverNotSupported {
        driver: config.driver.to_string(),
    }
    .into())
}
