//! Cache pool abstraction.
//!
//! A [`CachePool`] is the uniform surface every backend exposes to the
//! [`Store`](crate::Store). Pools work on storage keys only; escaping and
//! prefixing happen before a key reaches them.

use std::fmt;
use std::sync::Mutex;

use bitflags::bitflags;
use cairn_core::{BackendError, CacheEntry, CacheItem, CairnResult};

bitflags! {
    /// Optional behaviours a pool or store offers, fixed at construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Capabilities: u8 {
        /// Clearing a key also clears every key nested under it
        const HIERARCHICAL = 0b0000_0001;
        /// Tag invalidation is a single bulk backend command
        const NATIVE_TAGS = 0b0000_0010;
        /// Named leases are available
        const LOCKS = 0b0000_0100;
    }
}

/// Backend-facing cache operations.
pub trait CachePool: Send + Sync + fmt::Debug {
    /// Short backend name for logs and errors.
    fn backend_name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Look up one storage key. Expired records are evicted and reported as misses.
    fn get_item(&self, key: &str) -> CairnResult<CacheItem>;

    fn get_items(&self, keys: &[String]) -> CairnResult<Vec<CacheItem>> {
        keys.iter().map(|key| self.get_item(key)).collect()
    }

    /// Write a record, registering the key with every tag it carries.
    fn save(&self, key: &str, entry: CacheEntry) -> CairnResult<bool>;

    /// Queue for writers that batch.
    fn deferred(&self) -> &DeferredQueue;

    fn save_deferred(&self, key: &str, entry: CacheEntry) -> CairnResult<bool> {
        self.deferred().push(key, entry)?;
        Ok(true)
    }

    /// Flush the deferred queue. Stops at the first failing write.
    fn commit(&self) -> CairnResult<bool> {
        let mut saved = true;
        for (key, entry) in self.deferred().drain()? {
            saved &= self.save(&key, entry)?;
        }
        Ok(saved)
    }

    fn delete_item(&self, key: &str) -> CairnResult<bool>;

    /// Remove every record in the pool.
    fn clear(&self) -> CairnResult<bool>;

    /// Clear every member of each tag, then drop the tag lists.
    ///
    /// There is no atomicity across tags.
    fn invalidate_tags(&self, tag_keys: &[String]) -> CairnResult<bool>;

    fn invalidate_tag(&self, tag_key: &str) -> CairnResult<bool> {
        self.invalidate_tags(&[tag_key.to_string()])
    }

    /// Tag-scoped flush entry point.
    fn clear_tags(&self, tag_keys: &[String]) -> CairnResult<bool> {
        if tag_keys.is_empty() {
            return Ok(true);
        }
        self.invalidate_tags(tag_keys)
    }
}

// ============================================================================
// DEFERRED QUEUE
// ============================================================================

/// Pending writes for [`CachePool::save_deferred`].
#[derive(Debug, Default)]
pub struct DeferredQueue {
    items: Mutex<Vec<(String, CacheEntry)>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write. A later write to the same key replaces the earlier one.
    pub fn push(&self, key: &str, entry: CacheEntry) -> CairnResult<()> {
        let mut items = self.items.lock().map_err(|_| BackendError::LockPoisoned)?;
        items.retain(|(queued, _)| queued != key);
        items.push((key.to_string(), entry));
        Ok(())
    }

    pub fn drain(&self) -> CairnResult<Vec<(String, CacheEntry)>> {
        let mut items = self.items.lock().map_err(|_| BackendError::LockPoisoned)?;
        Ok(std::mem::take(&mut *items))
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
