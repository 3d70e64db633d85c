//! Generation-indexed hierarchy over a flat key/value namespace.
//!
//! A storage key starting with `|` is hierarchical. Each path prefix owns a
//! counter (its "index"), and the final storage key is a hash over every
//! segment together with the index of every prefix:
//!
//! ```text
//! key   |app|users|1
//! parts root, app, users, 1
//!
//! acc = "root"                          index(root)  = get(H("path!root"))
//! acc = "root!0!app"                    index(app)   = get(H("path!root!0!app"))
//! acc = "root!0!app!3!users"            index(users) = get(H("path!root!0!app!3!users"))
//! acc = "root!0!app!3!users!1!1"        index(1)     = get(H("path!root!0!app!3!users!1!1"))
//! storage key = H("root!0!app!3!users!1!1!0!")
//! ```
//!
//! Bumping the index of `|app|users` changes the accumulated string for the
//! key itself and every key below it, so the whole subtree becomes
//! unreachable without a scan. The orphaned records age out through their
//! backend TTL.

use cairn_core::{compute_key_hash, CairnResult};

use super::{decode_counter, KvConnection};

const HIERARCHY_SEPARATOR: char = '|';
const INDEX_SEPARATOR: char = '!';

/// Resolved storage location of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyKey {
    /// Where the record lives.
    pub storage_key: String,
    /// Counter of the last path segment; `None` for flat keys.
    pub path_key: Option<String>,
}

/// Hierarchy resolution over a connection.
pub struct KvHierarchy<'a> {
    conn: &'a dyn KvConnection,
}

impl<'a> KvHierarchy<'a> {
    pub fn new(conn: &'a dyn KvConnection) -> Self {
        Self { conn }
    }

    pub fn is_hierarchical(key: &str) -> bool {
        key.starts_with(HIERARCHY_SEPARATOR)
    }

    /// Resolve `key` to its current storage key. Flat keys pass through.
    pub fn resolve(&self, key: &str) -> CairnResult<HierarchyKey> {
        if !Self::is_hierarchical(key) {
            return Ok(HierarchyKey {
                storage_key: key.to_string(),
                path_key: None,
            });
        }

        let mut acc = String::new();
        let mut path_key = String::new();
        for (position, part) in key.split(HIERARCHY_SEPARATOR).enumerate() {
            acc.push_str(if position == 0 { "root" } else { part });
            path_key = compute_key_hash(&format!("path{INDEX_SEPARATOR}{acc}"));
            let index = self.index_of(&path_key)?;
            acc.push(INDEX_SEPARATOR);
            acc.push_str(&index.to_string());
            acc.push(INDEX_SEPARATOR);
        }

        Ok(HierarchyKey {
            storage_key: compute_key_hash(&acc),
            path_key: Some(path_key),
        })
    }

    /// Invalidate `key` and everything below it.
    pub fn bump(&self, resolved: &HierarchyKey) -> CairnResult<()> {
        if let Some(path_key) = &resolved.path_key {
            self.conn.increment(path_key, 1)?;
        }
        Ok(())
    }

    fn index_of(&self, path_key: &str) -> CairnResult<i64> {
        match self.conn.get(path_key)? {
            Some(bytes) => decode_counter(path_key, &bytes),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryConnection;
    use cairn_core::ManualClock;
    use std::sync::Arc;

    fn conn() -> InMemoryConnection {
        InMemoryConnection::new(Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_flat_keys_pass_through() {
        let conn = conn();
        let hierarchy = KvHierarchy::new(&conn);
        let resolved = hierarchy.resolve("tag!|app|t").unwrap();
        assert_eq!(resolved.storage_key, "tag!|app|t");
        assert_eq!(resolved.path_key, None);
    }

    #[test]
    fn test_resolution_is_stable() {
        let conn = conn();
        let hierarchy = KvHierarchy::new(&conn);
        let a = hierarchy.resolve("|app|a|b").unwrap();
        let b = hierarchy.resolve("|app|a|b").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.storage_key.len(), 64);
        assert_ne!(a.storage_key, hierarchy.resolve("|app|a").unwrap().storage_key);
    }

    #[test]
    fn test_bump_moves_subtree_only() {
        let conn = conn();
        let hierarchy = KvHierarchy::new(&conn);
        let parent = hierarchy.resolve("|app|a").unwrap();
        let child = hierarchy.resolve("|app|a|b").unwrap();
        let sibling = hierarchy.resolve("|app|ab").unwrap();

        hierarchy.bump(&parent).unwrap();

        assert_ne!(hierarchy.resolve("|app|a").unwrap(), parent);
        assert_ne!(
            hierarchy.resolve("|app|a|b").unwrap().storage_key,
            child.storage_key
        );
        assert_eq!(hierarchy.resolve("|app|ab").unwrap(), sibling);
    }

    #[test]
    fn test_bump_of_child_keeps_parent() {
        let conn = conn();
        let hierarchy = KvHierarchy::new(&conn);
        let parent = hierarchy.resolve("|app|a").unwrap();
        let child = hierarchy.resolve("|app|a|b").unwrap();
        hierarchy.bump(&child).unwrap();
        assert_eq!(hierarchy.resolve("|app|a").unwrap(), parent);
    }
}
