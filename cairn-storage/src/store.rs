//! The cache store façade.
//!
//! A [`Store`] turns logical keys into storage keys with its [`KeyCodec`],
//! wraps values into [`CacheEntry`] records and hands them to a
//! [`CachePool`]. Tagged writes go through [`Store::tags`], which returns a
//! one-shot [`TagScope`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use cairn_core::{
    ceil_secs, BackendError, CacheEntry, CairnError, CairnResult, Clock, KeyCodec, LockConfig, LockError,
    TagName, ValidationError, DEFAULT_TTL_SECS,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::lock::{CacheLock, LockBackend};
use crate::pool::{CachePool, Capabilities};
use crate::tag_scope::TagScope;

// ============================================================================
// STATS
// ============================================================================

/// Counters for one store since construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that found nothing or an expired entry.
    pub misses: u64,
    /// Records written, including increments.
    pub writes: u64,
    /// Explicit deletes.
    pub deletes: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Tag-aware cache store over one pool.
pub struct Store {
    pool: Arc<dyn CachePool>,
    codec: KeyCodec,
    locker: Option<Arc<dyn LockBackend>>,
    lock_config: LockConfig,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    stats: RwLock<CacheStats>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.pool.backend_name())
            .field("prefix", &self.codec.prefix())
            .field("locks", &self.locker.is_some())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl Store {
    pub fn new(pool: Arc<dyn CachePool>, codec: KeyCodec, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            codec,
            locker: None,
            lock_config: LockConfig::default(),
            clock,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Attach a lease backend; `config` governs how [`Store::lock`] waits.
    pub fn with_locker(mut self, locker: Arc<dyn LockBackend>, config: LockConfig) -> Self {
        self.locker = Some(locker);
        self.lock_config = config;
        self
    }

    /// TTL used by `put` and `put_many` when none is given.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn pool(&self) -> &Arc<dyn CachePool> {
        &self.pool
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    pub fn prefix(&self) -> &str {
        self.codec.prefix()
    }

    /// Storage key for a logical key.
    pub fn item_key(&self, key: &str) -> CairnResult<String> {
        self.codec.item_key(key)
    }

    pub fn capabilities(&self) -> Capabilities {
        let mut caps = self.pool.capabilities();
        if self.locker.is_some() {
            caps |= Capabilities::LOCKS;
        }
        caps
    }

    pub fn stats(&self) -> CairnResult<CacheStats> {
        self.stats
            .read()
            .map(|s| s.clone())
            .map_err(|_| BackendError::LockPoisoned.into())
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        if let Ok(mut stats) = self.stats.write() {
            update(&mut stats);
        }
    }

    /// Absolute expiry for a write, rounded up to whole seconds.
    fn expires_at(&self, ttl: Duration) -> i64 {
        self.clock.deadline_secs(Duration::from_secs(ceil_secs(ttl)))
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Value under `key`, or `None` on a miss.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> CairnResult<Option<T>> {
        let storage_key = self.codec.item_key(key)?;
        let item = self.pool.get_item(&storage_key)?;
        match item.entry {
            Some(entry) => {
                self.record(|s| s.hits += 1);
                Ok(Some(serde_json::from_value(entry.value)?))
            }
            None => {
                self.record(|s| s.misses += 1);
                Ok(None)
            }
        }
    }

    /// Values for several keys, keyed by the logical key.
    pub fn many<T, K>(&self, keys: &[K]) -> CairnResult<HashMap<String, Option<T>>>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        let storage_keys = keys
            .iter()
            .map(|k| self.codec.item_key(k.as_ref()))
            .collect::<CairnResult<Vec<_>>>()?;
        let items = self.pool.get_items(&storage_keys)?;

        let mut values = HashMap::with_capacity(keys.len());
        for (key, item) in keys.iter().zip(items) {
            let value = match item.entry {
                Some(entry) => {
                    self.record(|s| s.hits += 1);
                    Some(serde_json::from_value(entry.value)?)
                }
                None => {
                    self.record(|s| s.misses += 1);
                    None
                }
            };
            values.insert(key.as_ref().to_string(), value);
        }
        Ok(values)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Store `value` for `ttl`, or the default TTL when `None`.
    pub fn put<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
    ) -> CairnResult<bool> {
        self.put_tagged(key, value, Some(ttl.unwrap_or(self.default_ttl)), &[])
    }

    /// Store several values with one TTL. An empty batch writes nothing.
    pub fn put_many<K, V>(&self, values: &[(K, V)], ttl: Option<Duration>) -> CairnResult<bool>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        self.put_many_tagged(values, ttl, &[])
    }

    /// Store `value` without expiry.
    pub fn forever<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> CairnResult<bool> {
        self.put_tagged(key, value, None, &[])
    }

    /// Add `by` to an integer value, keeping its expiry and tags.
    ///
    /// Floats and numeric strings are truncated toward zero first.
    /// Returns `None` when the key is missing.
    pub fn increment(&self, key: &str, by: i64) -> CairnResult<Option<i64>> {
        self.adjust_tagged(key, by, &[])
    }

    pub fn decrement(&self, key: &str, by: i64) -> CairnResult<Option<i64>> {
        self.adjust_tagged(key, by.saturating_neg(), &[])
    }

    /// Remove `key`; on hierarchical pools its nested keys go too.
    pub fn forget(&self, key: &str) -> CairnResult<bool> {
        let storage_key = self.codec.item_key(key)?;
        let deleted = self.pool.delete_item(&storage_key)?;
        self.record(|s| s.deletes += 1);
        Ok(deleted)
    }

    /// Remove everything in the backend.
    pub fn flush(&self) -> CairnResult<bool> {
        let cleared = self.pool.clear()?;
        info!(backend = self.pool.backend_name(), prefix = %self.codec.prefix(), "cache flushed");
        Ok(cleared)
    }

    /// Bind `names` to the next operation issued through the returned scope.
    pub fn tags<I>(&self, names: I) -> CairnResult<TagScope<'_>>
    where
        I: IntoIterator,
        I::Item: fmt::Display,
    {
        let names: Vec<TagName> = names.into_iter().map(TagName::new).collect();
        let keys = names
            .iter()
            .map(|name| self.codec.tag_key(name.as_str()))
            .collect::<CairnResult<Vec<_>>>()?;
        Ok(TagScope::new(self, names, keys))
    }

    // ------------------------------------------------------------------------
    // Tagged operations, shared with TagScope
    // ------------------------------------------------------------------------

    /// `ttl = None` never expires.
    pub(crate) fn put_tagged<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
        tags: &[String],
    ) -> CairnResult<bool> {
        let storage_key = self.codec.item_key(key)?;
        let entry = self.new_entry(serde_json::to_value(value)?, ttl, tags);
        let saved = self.pool.save(&storage_key, entry)?;
        self.record(|s| s.writes += 1);
        Ok(saved)
    }

    pub(crate) fn put_many_tagged<K, V>(
        &self,
        values: &[(K, V)],
        ttl: Option<Duration>,
        tags: &[String],
    ) -> CairnResult<bool>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        if values.is_empty() {
            return Ok(false);
        }
        let ttl = Some(ttl.unwrap_or(self.default_ttl));
        for (key, value) in values {
            let storage_key = self.codec.item_key(key.as_ref())?;
            let entry = self.new_entry(serde_json::to_value(value)?, ttl, tags);
            self.pool.save_deferred(&storage_key, entry)?;
        }
        let committed = self.pool.commit()?;
        self.record(|s| s.writes += values.len() as u64);
        Ok(committed)
    }

    /// Read-modify-write of an integer record. Scope tags are added to the
    /// record's existing tags.
    pub(crate) fn adjust_tagged(
        &self,
        key: &str,
        delta: i64,
        tags: &[String],
    ) -> CairnResult<Option<i64>> {
        let storage_key = self.codec.item_key(key)?;
        let Some(mut entry) = self.pool.get_item(&storage_key)?.entry else {
            self.record(|s| s.misses += 1);
            return Ok(None);
        };
        self.record(|s| s.hits += 1);

        let current = integer_value(&entry.value).ok_or_else(|| {
            CairnError::from(ValidationError::NotAnInteger {
                key: key.to_string(),
            })
        })?;
        let next = current.saturating_add(delta);
        entry.value = Value::from(next);
        for tag in tags {
            if !entry.tags.contains(tag) {
                entry.tags.push(tag.clone());
            }
        }
        self.pool.save(&storage_key, entry)?;
        self.record(|s| s.writes += 1);
        Ok(Some(next))
    }

    fn new_entry(&self, value: Value, ttl: Option<Duration>, tags: &[String]) -> CacheEntry {
        CacheEntry::new(value)
            .with_tags(tags.to_vec())
            .with_expires_at(ttl.map(|ttl| self.expires_at(ttl)))
    }

    // ------------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------------

    /// Acquire the lease `name` under the store prefix.
    ///
    /// Makes one attempt, then retries for `lock.wait` if configured. Fails
    /// with [`LockError::AlreadyHeld`] while another owner holds it.
    pub fn lock(&self, name: &str, ttl: Duration, owner: Option<&str>) -> CairnResult<CacheLock> {
        let handle = self.lock_handle(name, ttl, owner)?;
        if handle.acquire()? {
            return Ok(handle);
        }

        let wait = self.lock_config.wait();
        if !wait.is_zero() {
            match handle.block(wait) {
                Ok(()) => return Ok(handle),
                Err(CairnError::Lock(LockError::Timeout { .. })) => {}
                Err(err) => return Err(err),
            }
        }
        Err(LockError::AlreadyHeld {
            name: name.to_string(),
        }
        .into())
    }

    /// Rebuild a handle for a lease acquired elsewhere, without acquiring.
    pub fn restore_lock(&self, name: &str, owner: &str) -> CairnResult<CacheLock> {
        self.lock_handle(name, Duration::ZERO, Some(owner))
    }

    fn lock_handle(&self, name: &str, ttl: Duration, owner: Option<&str>) -> CairnResult<CacheLock> {
        let locker = self.locker.clone().ok_or_else(|| {
            CairnError::from(LockError::Unsupported {
                driver: self.pool.backend_name().to_string(),
            })
        })?;
        let lease_key = self.codec.item_key(name)?;
        Ok(
            CacheLock::new(locker, lease_key, ttl, owner.map(str::to_string))
                .with_retry_interval(self.lock_config.retry_interval()),
        )
    }
}

/// Integer view of a stored value; numeric strings count and fractions
/// truncate, saturating at the `i64` bounds.
fn integer_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

// =============================================================================
// TESTS
// =============================================================================
