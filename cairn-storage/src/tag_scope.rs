//! One-shot tag binding.
//!
//! `store.tags(["a", "b"])` resolves the names to tag keys and returns a
//! [`TagScope`]. Every scope method takes `self`, so the binding reaches
//! exactly one operation and can never leak into a later, untagged call.

use std::collections::HashMap;
use std::time::Duration;

use cairn_core::{CairnResult, TagName};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::store::Store;

/// Tag keys waiting for the next operation. Reading them clears the slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingTags(Option<Vec<String>>);

impl PendingTags {
    pub fn bind(tag_keys: Vec<String>) -> Self {
        Self(Some(tag_keys))
    }

    /// Consume the binding; an unbound slot yields no tags.
    pub fn take(&mut self) -> Vec<String> {
        self.0.take().unwrap_or_default()
    }
}

/// Store operations carrying a bound tag set.
#[derive(Debug)]
pub struct TagScope<'s> {
    store: &'s Store,
    names: Vec<TagName>,
    pending: PendingTags,
}

impl<'s> TagScope<'s> {
    pub(crate) fn new(store: &'s Store, names: Vec<TagName>, tag_keys: Vec<String>) -> Self {
        Self {
            store,
            names,
            pending: PendingTags::bind(tag_keys),
        }
    }

    pub fn names(&self) -> &[TagName] {
        &self.names
    }

    /// Storage keys of the bound tags.
    pub fn tag_keys(&self) -> &[String] {
        self.pending.0.as_deref().unwrap_or_default()
    }

    pub fn put<V: Serialize + ?Sized>(
        mut self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
    ) -> CairnResult<bool> {
        let tags = self.pending.take();
        let ttl = Some(ttl.unwrap_or(self.store.default_ttl()));
        self.store.put_tagged(key, value, ttl, &tags)
    }

    pub fn put_many<K, V>(mut self, values: &[(K, V)], ttl: Option<Duration>) -> CairnResult<bool>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        let tags = self.pending.take();
        self.store.put_many_tagged(values, ttl, &tags)
    }

    pub fn forever<V: Serialize + ?Sized>(mut self, key: &str, value: &V) -> CairnResult<bool> {
        let tags = self.pending.take();
        self.store.put_tagged(key, value, None, &tags)
    }

    /// Adds the bound tags to the record's existing ones.
    pub fn increment(mut self, key: &str, by: i64) -> CairnResult<Option<i64>> {
        let tags = self.pending.take();
        self.store.adjust_tagged(key, by, &tags)
    }

    pub fn decrement(mut self, key: &str, by: i64) -> CairnResult<Option<i64>> {
        let tags = self.pending.take();
        self.store.adjust_tagged(key, by.saturating_neg(), &tags)
    }

    /// Reads ignore the binding.
    pub fn get<T: DeserializeOwned>(mut self, key: &str) -> CairnResult<Option<T>> {
        self.pending.take();
        self.store.get(key)
    }

    pub fn many<T, K>(mut self, keys: &[K]) -> CairnResult<HashMap<String, Option<T>>>
    where
        T: DeserializeOwned,
        K: AsRef<str>,
    {
        self.pending.take();
        self.store.many(keys)
    }

    pub fn forget(mut self, key: &str) -> CairnResult<bool> {
        self.pending.take();
        self.store.forget(key)
    }

    /// Clear every entry carrying one of the bound tags. Entries with other
    /// tags, and untagged entries, stay.
    pub fn flush(mut self) -> CairnResult<bool> {
        let tags = self.pending.take();
        for (name, key) in self.names.iter().zip(&tags) {
            debug!(tag = %name, tag_key = %key, "flushing tag");
        }
        self.store.pool().clear_tags(&tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{InMemoryConnection, KvCachePool};
    use cairn_core::{KeyCodec, KeyRules, ManualClock};
    use std::sync::Arc;

    fn create_test_store() -> Store {
        let clock = Arc::new(ManualClock::new(ManualClock::DEFAULT_EPOCH_SECS));
        let conn = Arc::new(InMemoryConnection::new(clock.clone()));
        Store::new(
            Arc::new(KvCachePool::new(conn, clock.clone())),
            KeyCodec::new(KeyRules::Protocol, "app"),
            clock,
        )
    }

    #[test]
    fn test_pending_tags_are_one_shot() {
        let mut pending = PendingTags::bind(vec!["|app|t".to_string()]);
        assert_eq!(pending.take(), vec!["|app|t"]);
        assert_eq!(pending, PendingTags::default());
        assert!(pending.take().is_empty());
    }

    #[test]
    fn test_scope_resolves_tag_keys() {
        let store = create_test_store();
        let scope = store.tags(["users", "users/admins"]).unwrap();
        assert_eq!(scope.tag_keys(), ["|app|users", "|app|users-admins"]);
        assert_eq!(scope.names()[1].as_str(), "users/admins");
    }

    #[test]
    fn test_tagged_flush_spares_other_tags() {
        let store = create_test_store();
        store.tags(["t"]).unwrap().put("a", &1, None).unwrap();
        store.tags(["u"]).unwrap().put("b", &2, None).unwrap();
        store.put("c", &3, None).unwrap();

        assert!(store.tags(["t"]).unwrap().flush().unwrap());
        assert_eq!(store.get::<i32>("a").unwrap(), None);
        assert_eq!(store.get::<i32>("b").unwrap(), Some(2));
        assert_eq!(store.get::<i32>("c").unwrap(), Some(3));
    }

    #[test]
    fn test_untagged_write_after_scope_is_untagged() {
        let store = create_test_store();
        let scope = store.tags(["t"]).unwrap();
        store.put("plain", &1, None).unwrap();
        scope.put("tagged", &2, None).unwrap();

        store.tags(["t"]).unwrap().flush().unwrap();
        assert_eq!(store.get::<i32>("plain").unwrap(), Some(1));
        assert_eq!(store.get::<i32>("tagged").unwrap(), None);
    }

    #[test]
    fn test_tagged_increment_adds_tag() {
        let store = create_test_store();
        store.put("n", &1, None).unwrap();
        assert_eq!(store.tags(["t"]).unwrap().increment("n", 2).unwrap(), Some(3));
        store.tags(["t"]).unwrap().flush().unwrap();
        assert_eq!(store.get::<i64>("n").unwrap(), None);
    }

    #[test]
    fn test_empty_scope_flush_keeps_everything() {
        let store = create_test_store();
        store.put("a", &1, None).unwrap();
        let none: [&str; 0] = [];
        assert!(store.tags(none).unwrap().flush().unwrap());
        assert_eq!(store.get::<i32>("a").unwrap(), Some(1));
    }
}
