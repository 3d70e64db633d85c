//! Cache pool over a [`KvConnection`].
//!
//! Records are JSON `{"value", "tags", "expires_at"}` stored under the key
//! resolved by [`KvHierarchy`]. The backend also gets a native TTL of the
//! remaining lifetime plus [`EXPIRY_GRACE`].

use std::sync::Arc;
use std::time::Duration;

use cairn_core::{BackendError, CacheEntry, CacheItem, CairnError, CairnResult, Clock};
use tracing::{debug, info, warn};

use super::{ConnectionCapabilities, HierarchyKey, KvConnection, KvHierarchy};
use crate::pool::{CachePool, Capabilities, DeferredQueue};
use crate::tag_index::{tag_list_key, TagIndex, TagListStore};

/// How long the backend keeps a record past its logical expiry, so a late
/// read still finds its tags to scrub.
pub const EXPIRY_GRACE: Duration = Duration::from_secs(60);

/// Key/value [`CachePool`] with path-indexed hierarchy and list-backed tags.
#[derive(Debug)]
pub struct KvCachePool {
    conn: Arc<dyn KvConnection>,
    clock: Arc<dyn Clock>,
    deferred: DeferredQueue,
}

impl KvCachePool {
    pub fn new(conn: Arc<dyn KvConnection>, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn,
            clock,
            deferred: DeferredQueue::new(),
        }
    }

    pub fn connection(&self) -> &Arc<dyn KvConnection> {
        &self.conn
    }

    fn hierarchy(&self) -> KvHierarchy<'_> {
        KvHierarchy::new(self.conn.as_ref())
    }

    fn read_entry(&self, resolved: &HierarchyKey, key: &str) -> CairnResult<Option<CacheEntry>> {
        match self.conn.get(&resolved.storage_key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| BackendError::corrupt(key, e).into()),
            None => Ok(None),
        }
    }

    /// Tags of the current record; a corrupt record has none we can trust.
    fn current_tags(&self, resolved: &HierarchyKey, key: &str) -> CairnResult<Vec<String>> {
        match self.read_entry(resolved, key) {
            Ok(entry) => Ok(entry.map(|e| e.tags).unwrap_or_default()),
            Err(CairnError::Backend(err @ BackendError::CorruptRecord { .. })) => {
                warn!(key = %key, error = %err, "dropping corrupt cache record");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Bump the key's path index, then drop its record.
    fn force_clear(&self, key: &str) -> CairnResult<()> {
        let hierarchy = self.hierarchy();
        let resolved = hierarchy.resolve(key)?;
        hierarchy.bump(&resolved)?;
        self.conn.delete(&resolved.storage_key)?;
        Ok(())
    }

    /// One multi-key delete for every member and list, then path bumps.
    fn invalidate_bulk(&self, tag_keys: &[String]) -> CairnResult<()> {
        let index = TagIndex::new(self);
        let hierarchy = self.hierarchy();
        let mut doomed = Vec::new();
        let mut resolved_members = Vec::new();
        for tag in tag_keys {
            let members = index.members(tag)?;
            debug!(tag = %tag, members = members.len(), "invalidating tag");
            for member in members {
                let resolved = hierarchy.resolve(&member)?;
                doomed.push(resolved.storage_key.clone());
                resolved_members.push(resolved);
            }
            doomed.push(tag_list_key(tag));
        }
        self.conn.delete_many(&doomed)?;
        for resolved in &resolved_members {
            hierarchy.bump(resolved)?;
        }
        Ok(())
    }

    /// Clear members one at a time, then drop the tag lists. A failure
    /// leaves every list in place so a retry sees the same members.
    fn invalidate_walk(&self, tag_keys: &[String]) -> CairnResult<()> {
        let index = TagIndex::new(self);
        for tag in tag_keys {
            let members = index.members(tag)?;
            debug!(tag = %tag, members = members.len(), "invalidating tag");
            for (cleared, member) in members.iter().enumerate() {
                if let Err(err) = self.force_clear(member) {
                    warn!(tag = %tag, member = %member, error = %err, "tag invalidation stopped");
                    return Err(BackendError::PartialInvalidation {
                        tag: tag.clone(),
                        cleared,
                        remaining: members.len() - cleared,
                        reason: err.to_string(),
                    }
                    .into());
                }
            }
        }
        index.reset_all(tag_keys)?;
        Ok(())
    }
}

impl TagListStore for KvCachePool {
    fn read_list(&self, list_key: &str) -> CairnResult<Vec<String>> {
        self.conn.list_range(list_key)
    }

    fn append_list_item(&self, list_key: &str, member: &str) -> CairnResult<()> {
        self.conn.list_push(list_key, member)
    }

    fn remove_list_item(&self, list_key: &str, member: &str) -> CairnResult<()> {
        self.conn.list_remove(list_key, member)
    }

    fn remove_list(&self, list_key: &str) -> CairnResult<()> {
        self.conn.delete(list_key).map(|_| ())
    }
}

impl CachePool for KvCachePool {
    fn backend_name(&self) -> &'static str {
        self.conn.backend_name()
    }

    fn capabilities(&self) -> Capabilities {
        let mut caps = Capabilities::HIERARCHICAL;
        if self
            .conn
            .capabilities()
            .contains(ConnectionCapabilities::BULK_DELETE)
        {
            caps |= Capabilities::NATIVE_TAGS;
        }
        caps
    }

    fn get_item(&self, key: &str) -> CairnResult<CacheItem> {
        let resolved = self.hierarchy().resolve(key)?;
        let Some(entry) = self.read_entry(&resolved, key)? else {
            return Ok(CacheItem::miss(key));
        };
        if !entry.is_expired(self.clock.now_epoch_secs()) {
            return Ok(CacheItem::hit(key, entry));
        }

        let index = TagIndex::new(self);
        for tag in &entry.tags {
            index.remove_member(tag, key)?;
        }
        self.conn.delete(&resolved.storage_key)?;
        debug!(key = %key, "evicted expired cache entry");
        Ok(CacheItem::miss(key))
    }

    fn save(&self, key: &str, entry: CacheEntry) -> CairnResult<bool> {
        let resolved = self.hierarchy().resolve(key)?;
        let index = TagIndex::new(self);
        for old in self.current_tags(&resolved, key)? {
            if !entry.tags.contains(&old) {
                index.remove_member(&old, key)?;
            }
        }
        for tag in &entry.tags {
            index.add_member(tag, key)?;
        }

        let ttl = entry
            .remaining_secs(self.clock.now_epoch_secs())
            .map(|secs| Duration::from_secs(secs).saturating_add(EXPIRY_GRACE));
        let bytes = serde_json::to_vec(&entry)?;
        self.conn.set(&resolved.storage_key, &bytes, ttl)?;
        Ok(true)
    }

    fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    fn delete_item(&self, key: &str) -> CairnResult<bool> {
        let hierarchy = self.hierarchy();
        let resolved = hierarchy.resolve(key)?;
        let index = TagIndex::new(self);
        for tag in self.current_tags(&resolved, key)? {
            index.remove_member(&tag, key)?;
        }
        hierarchy.bump(&resolved)?;
        self.conn.delete(&resolved.storage_key)?;
        Ok(true)
    }

    fn clear(&self) -> CairnResult<bool> {
        self.conn.flush()?;
        info!(backend = self.conn.backend_name(), "flushed cache backend");
        Ok(true)
    }

    fn invalidate_tags(&self, tag_keys: &[String]) -> CairnResult<bool> {
        if self
            .conn
            .capabilities()
            .contains(ConnectionCapabilities::BULK_DELETE)
        {
            self.invalidate_bulk(tag_keys)?;
        } else {
            self.invalidate_walk(tag_keys)?;
        }
        Ok(true)
    }
}

// =============================================================================
// TESTS
// =============================================================================
