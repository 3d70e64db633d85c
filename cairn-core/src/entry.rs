//! Cache records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A caller-supplied tag name, before key escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagName(pub String);

impl TagName {
    pub fn new(name: impl fmt::Display) -> Self {
        Self(name.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TagName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for TagName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// The stored record: value, absolute expiry and the tag keys it belongs to.
///
/// `expires_at` is epoch seconds; `None` never expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// On-disk tuple used by the file engine: `[expires_at, value, tags]`.
pub type FileRecord = (Option<i64>, Value, Vec<String>);

impl CacheEntry {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            tags: Vec::new(),
            expires_at: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_expires_at(mut self, expires_at: Option<i64>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Expiry is inclusive: an entry whose deadline equals `now` is gone.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }

    /// Seconds left before expiry, `None` for entries that never expire.
    ///
    /// Never returns less than one second for a live entry.
    pub fn remaining_secs(&self, now: i64) -> Option<u64> {
        self.expires_at
            .map(|at| u64::try_from(at.saturating_sub(now)).map_or(1, |secs| secs.max(1)))
    }

    pub fn into_file_record(self) -> FileRecord {
        (self.expires_at, self.value, self.tags)
    }

    pub fn from_file_record((expires_at, value, tags): FileRecord) -> Self {
        Self {
            value,
            tags,
            expires_at,
        }
    }
}

/// Result of a pool lookup, keyed by storage key.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
    pub key: String,
    pub entry: Option<CacheEntry>,
}

impl CacheItem {
    pub fn hit(key: impl Into<String>, entry: CacheEntry) -> Self {
        Self {
            key: key.into(),
            entry: Some(entry),
        }
    }

    pub fn miss(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            entry: None,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.entry.is_some()
    }

    pub fn value(&self) -> Option<&Value> {
        self.entry.as_ref().map(|e| &e.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expiry_is_inclusive() {
        let entry = CacheEntry::new(json!(1)).with_expires_at(Some(100));
        assert!(!entry.is_expired(99));
        assert!(entry.is_expired(100));
        assert!(entry.is_expired(101));
    }

    #[test]
    fn test_forever_entry_never_expires() {
        let entry = CacheEntry::new(json!("x"));
        assert!(!entry.is_expired(i64::MAX));
        assert_eq!(entry.remaining_secs(0), None);
    }

    #[test]
    fn test_remaining_secs_floors_at_one() {
        let entry = CacheEntry::new(json!(1)).with_expires_at(Some(10));
        assert_eq!(entry.remaining_secs(4), Some(6));
        assert_eq!(entry.remaining_secs(10), Some(1));

        let distant = CacheEntry::new(json!(1)).with_expires_at(Some(i64::MAX));
        assert_eq!(distant.remaining_secs(-10), Some(i64::MAX as u64));
        assert!(!distant.is_expired(i64::MAX - 1));
    }

    #[test]
    fn test_file_record_is_json_triple() {
        let entry = CacheEntry::new(json!({"a": 1}))
            .with_expires_at(Some(42))
            .with_tags(vec!["|app|t1".to_string()]);
        let encoded = serde_json::to_string(&entry.clone().into_file_record()).unwrap();
        assert_eq!(encoded, r#"[42,{"a":1},["|app|t1"]]"#);

        let decoded: FileRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(CacheEntry::from_file_record(decoded), entry);
    }

    #[test]
    fn test_forever_file_record_uses_null() {
        let record = CacheEntry::new(json!(true)).into_file_record();
        assert_eq!(serde_json::to_string(&record).unwrap(), "[null,true,[]]");
    }

    #[test]
    fn test_kv_record_tolerates_missing_fields() {
        let entry: CacheEntry = serde_json::from_str(r#"{"value": 5}"#).unwrap();
        assert_eq!(entry.value, json!(5));
        assert!(entry.tags.is_empty());
        assert_eq!(entry.expires_at, None);
    }

    #[test]
    fn test_tag_name_from_display() {
        assert_eq!(TagName::new(42).as_str(), "42");
        assert_eq!(TagName::from("users").to_string(), "users");
    }

    #[test]
    fn test_cache_item_hit_and_miss() {
        let hit = CacheItem::hit("k", CacheEntry::new(json!(1)));
        assert!(hit.is_hit());
        assert_eq!(hit.value(), Some(&json!(1)));
        assert!(!CacheItem::miss("k").is_hit());
    }
}
