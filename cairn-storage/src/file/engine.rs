//! Filesystem cache engine.
//!
//! Records live under `<base>/cache`, tag member lists under `<base>/tags`.
//! In the hierarchical layout every
//! `|`-separated segment of a storage key is one directory level, so a key
//! can hold a value and be the parent of other keys at the same time:
//!
//! ```text
//! <base>/cache/
//! ├── app/
//! │   ├── users#           record of |app|users
//! │   └── users/
//! │       ├── 1#           record of |app|users|1
//! │       └── 2#           record of |app|users|2
//! <base>/tags/
//! └── tag!/
//!     └── app/
//!         └── admins#      member list of tag |app|admins
//! ```
//!
//! Clearing `|app|users` removes `users#` and the `users/` subtree, which is
//! the whole cascade-delete. The flat layout keeps every record directly
//! under the root and never cascades.
//!
//! Tag lists are read, mutated and rewritten whole; concurrent writers to
//! the same tag can lose updates.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cairn_core::{
    BackendError, CacheEntry, CacheItem, CairnError, CairnResult, Clock, FilePermissions,
    FileRecord, ValidationError,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::pool::{CachePool, Capabilities, DeferredQueue};
use crate::tag_index::{push_unique, TagIndex, TagListStore};

static HIERARCHICAL_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.! |]+$").expect("Invalid hierarchical key regex"));
static FLAT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_.! ]+$").expect("Invalid flat key regex"));

/// Suffix of record files; outside every key alphabet.
const RECORD_SUFFIX: &str = "#";

/// How storage keys map onto the directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileLayout {
    /// `|` separates directory levels.
    Hierarchical,
    /// One file per key, directly under the root.
    Flat,
}

/// File-backed [`CachePool`].
#[derive(Debug)]
pub struct FileCachePool {
    root: PathBuf,
    tags_root: PathBuf,
    layout: FileLayout,
    permissions: FilePermissions,
    clock: Arc<dyn Clock>,
    deferred: DeferredQueue,
}

impl FileCachePool {
    /// Open (and create) the cache directories `<base>/cache` and `<base>/tags`.
    pub fn open(
        base: impl AsRef<Path>,
        layout: FileLayout,
        permissions: FilePermissions,
        clock: Arc<dyn Clock>,
    ) -> CairnResult<Self> {
        let pool = Self {
            root: base.as_ref().join("cache"),
            tags_root: base.as_ref().join("tags"),
            layout,
            permissions,
            clock,
            deferred: DeferredQueue::new(),
        };
        pool.create_dir_all(&pool.root)?;
        pool.create_dir_all(&pool.tags_root)?;
        Ok(pool)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> FileLayout {
        self.layout
    }

    // ------------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------------

    fn validate_key(&self, key: &str) -> CairnResult<()> {
        if key.is_empty() {
            return Err(ValidationError::EmptyKey.into());
        }
        let pattern = match self.layout {
            FileLayout::Hierarchical => &HIERARCHICAL_KEY,
            FileLayout::Flat => &FLAT_KEY,
        };
        if !pattern.is_match(key) {
            return Err(invalid_key(key, "contains characters outside the file key alphabet"));
        }
        Ok(())
    }

    /// Directory that holds the descendants of `key`.
    pub fn node_path(&self, key: &str) -> CairnResult<PathBuf> {
        self.path_under(&self.root, key)
    }

    fn path_under(&self, root: &Path, key: &str) -> CairnResult<PathBuf> {
        self.validate_key(key)?;
        let mut path = root.to_path_buf();
        let segments: Vec<&str> = match self.layout {
            FileLayout::Hierarchical => key.split('|').filter(|s| !s.is_empty()).collect(),
            FileLayout::Flat => vec![key],
        };
        if segments.is_empty() {
            return Err(invalid_key(key, "no path segments"));
        }
        for segment in segments {
            if segment == "." || segment == ".." {
                return Err(invalid_key(key, "relative path segment"));
            }
            path.push(segment);
        }
        Ok(path)
    }

    /// File holding the record of `key`.
    pub fn record_path(&self, key: &str) -> CairnResult<PathBuf> {
        with_record_suffix(self.node_path(key)?, key)
    }

    /// File holding the tag member list `list_key`.
    pub fn list_path(&self, list_key: &str) -> CairnResult<PathBuf> {
        with_record_suffix(self.path_under(&self.tags_root, list_key)?, list_key)
    }

    // ------------------------------------------------------------------------
    // Raw I/O
    // ------------------------------------------------------------------------

    fn create_dir_all(&self, dir: &Path) -> CairnResult<()> {
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        set_dir_mode(&mut builder, self.permissions.dir);
        builder
            .create(dir)
            .map_err(|e| BackendError::io(dir.display(), &e).into())
    }

    fn write_file(&self, path: &Path, bytes: &[u8]) -> CairnResult<()> {
        if let Some(parent) = path.parent() {
            self.create_dir_all(parent)?;
        }
        fs::write(path, bytes).map_err(|e| BackendError::io(path.display(), &e))?;
        set_file_mode(path, self.permissions.file)
    }

    /// Read the stored record without any expiry check.
    fn read_record(&self, key: &str) -> CairnResult<Option<CacheEntry>> {
        let path = self.record_path(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::io(path.display(), &e).into()),
        };
        let record: FileRecord =
            serde_json::from_slice(&bytes).map_err(|e| BackendError::corrupt(key, e))?;
        Ok(Some(CacheEntry::from_file_record(record)))
    }

    /// Tags of the current record; a corrupt record has none we can trust.
    fn current_tags(&self, key: &str) -> CairnResult<Vec<String>> {
        match self.read_record(key) {
            Ok(entry) => Ok(entry.map(|e| e.tags).unwrap_or_default()),
            Err(CairnError::Backend(err @ BackendError::CorruptRecord { .. })) => {
                warn!(key = %key, error = %err, "dropping corrupt cache record");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn write_record(&self, key: &str, entry: &CacheEntry) -> CairnResult<()> {
        let path = self.record_path(key)?;
        // Delete-then-write: the key reads as absent in between.
        remove_file_if_exists(&path)?;
        let bytes = serde_json::to_vec(&entry.clone().into_file_record())?;
        self.write_file(&path, &bytes)
    }

    // ------------------------------------------------------------------------
    // Engine operations
    // ------------------------------------------------------------------------

    /// Write `value` under `key`; `ttl = None` never expires.
    pub fn store(
        &self,
        key: &str,
        value: Value,
        tags: Vec<String>,
        ttl: Option<Duration>,
    ) -> CairnResult<()> {
        let expires_at = ttl.map(|ttl| self.clock.deadline_secs(ttl));
        let entry = CacheEntry::new(value)
            .with_tags(tags)
            .with_expires_at(expires_at);
        self.save(key, entry).map(|_| ())
    }

    /// Read a live record. An expired one is evicted, together with its tag
    /// memberships and any keys nested under it.
    pub fn fetch(&self, key: &str) -> CairnResult<Option<CacheEntry>> {
        let Some(entry) = self.read_record(key)? else {
            return Ok(None);
        };
        if !entry.is_expired(self.clock.now_epoch_secs()) {
            return Ok(Some(entry));
        }

        let index = TagIndex::new(self);
        for tag in &entry.tags {
            index.remove_member(tag, key)?;
        }
        self.force_clear(key)?;
        debug!(key = %key, "evicted expired cache entry");
        Ok(None)
    }

    /// Remove the record of `key` and the subtree below it.
    pub fn force_clear(&self, key: &str) -> CairnResult<()> {
        remove_file_if_exists(&self.record_path(key)?)?;
        if self.layout == FileLayout::Hierarchical {
            let node = self.node_path(key)?;
            match fs::remove_dir_all(&node) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(BackendError::io(node.display(), &e).into()),
            }
        }
        Ok(())
    }

    /// Scrub `key` from its tags, then [`force_clear`](Self::force_clear) it.
    pub fn clear_one(&self, key: &str) -> CairnResult<()> {
        let index = TagIndex::new(self);
        for tag in self.current_tags(key)? {
            index.remove_member(&tag, key)?;
        }
        self.force_clear(key)
    }

    /// Drop and recreate the record and tag directories.
    pub fn clear_all(&self) -> CairnResult<()> {
        for dir in [&self.root, &self.tags_root] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(BackendError::io(dir.display(), &e).into()),
            }
            self.create_dir_all(dir)?;
        }
        Ok(())
    }

    fn write_list(&self, path: &Path, list: &[String]) -> CairnResult<()> {
        let bytes = serde_json::to_vec(list)?;
        self.write_file(path, &bytes)
    }
}

fn with_record_suffix(node: PathBuf, key: &str) -> CairnResult<PathBuf> {
    let mut name = node
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| invalid_key(key, "no file name"))?;
    name.push(RECORD_SUFFIX);
    Ok(node.with_file_name(name))
}

fn invalid_key(key: &str, reason: &str) -> CairnError {
    ValidationError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(unix)]
fn set_dir_mode(builder: &mut fs::DirBuilder, mode: Option<u32>) {
    use std::os::unix::fs::DirBuilderExt;
    if let Some(mode) = mode {
        builder.mode(mode);
    }
}

#[cfg(not(unix))]
fn set_dir_mode(_builder: &mut fs::DirBuilder, _mode: Option<u32>) {}

#[cfg(unix)]
pub(crate) fn set_file_mode(path: &Path, mode: Option<u32>) -> CairnResult<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| BackendError::io(path.display(), &e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn set_file_mode(_path: &Path, _mode: Option<u32>) -> CairnResult<()> {
    Ok(())
}

pub(crate) fn remove_file_if_exists(path: &Path) -> CairnResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackendError::io(path.display(), &e).into()),
    }
}

// ============================================================================
// TAG LISTS
// ============================================================================

impl TagListStore for FileCachePool {
    fn read_list(&self, list_key: &str) -> CairnResult<Vec<String>> {
        let path = self.list_path(list_key)?;
        match fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| BackendError::corrupt(list_key, e).into())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.write_list(&path, &[])?;
                Ok(Vec::new())
            }
            Err(e) => Err(BackendError::io(path.display(), &e).into()),
        }
    }

    fn append_list_item(&self, list_key: &str, member: &str) -> CairnResult<()> {
        let mut list = self.read_list(list_key)?;
        if push_unique(&mut list, member) {
            self.write_list(&self.list_path(list_key)?, &list)?;
        }
        Ok(())
    }

    fn remove_list_item(&self, list_key: &str, member: &str) -> CairnResult<()> {
        let mut list = self.read_list(list_key)?;
        let before = list.len();
        list.retain(|m| m != member);
        if list.len() != before {
            self.write_list(&self.list_path(list_key)?, &list)?;
        }
        Ok(())
    }

    fn remove_list(&self, list_key: &str) -> CairnResult<()> {
        remove_file_if_exists(&self.list_path(list_key)?)
    }
}

// ============================================================================
// POOL
// ============================================================================

impl CachePool for FileCachePool {
    fn backend_name(&self) -> &'static str {
        match self.layout {
            FileLayout::Hierarchical => "hierarchial_file",
            FileLayout::Flat => "file",
        }
    }

    fn capabilities(&self) -> Capabilities {
        match self.layout {
            FileLayout::Hierarchical => Capabilities::HIERARCHICAL,
            FileLayout::Flat => Capabilities::empty(),
        }
    }

    fn get_item(&self, key: &str) -> CairnResult<CacheItem> {
        Ok(match self.fetch(key)? {
            Some(entry) => CacheItem::hit(key, entry),
            None => CacheItem::miss(key),
        })
    }

    fn save(&self, key: &str, entry: CacheEntry) -> CairnResult<bool> {
        let index = TagIndex::new(self);
        for old in self.current_tags(key)? {
            if !entry.tags.contains(&old) {
                index.remove_member(&old, key)?;
            }
        }
        for tag in &entry.tags {
            index.add_member(tag, key)?;
        }
        self.write_record(key, &entry)?;
        Ok(true)
    }

    fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    fn delete_item(&self, key: &str) -> CairnResult<bool> {
        self.clear_one(key)?;
        Ok(true)
    }

    fn clear(&self) -> CairnResult<bool> {
        self.clear_all()?;
        info!(root = %self.root.display(), "cleared file cache");
        Ok(true)
    }

    fn invalidate_tags(&self, tag_keys: &[String]) -> CairnResult<bool> {
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
        Ok(true)
    }
}

// =============================================================================
// TESTS
// =============================================================================
