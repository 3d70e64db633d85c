//! Cairn Test Utilities
//!
//! Shared test infrastructure for the cairn workspace:
//! - Proptest generators for keys, tag names, values and TTLs
//! - Store fixtures over every local driver, on a manual clock
//! - Custom assertions for cache lookups and key encoding

use std::sync::Arc;

pub use cairn_core::{
    CairnError, CairnResult, Clock, KeyCodec, KeyRules, ManualClock, StoreConfig,
};
pub use cairn_storage::{build_store_with_clock, Store};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for cairn inputs.

    use proptest::prelude::*;
    use serde_json::Value;

    /// One path segment made of realistic key characters.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_-]{0,11}"
    }

    /// A logical key of one to four `|`-separated segments.
    pub fn arb_logical_key() -> impl Strategy<Value = String> {
        prop::collection::vec(arb_segment(), 1..=4).prop_map(|parts| parts.join("|"))
    }

    /// A tag name, possibly containing `/`.
    pub fn arb_tag_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9]{0,7}(/[a-z0-9]{1,6})?"
    }

    /// A JSON value up to two levels deep.
    pub fn arb_json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,24}".prop_map(Value::from),
        ];
        leaf.prop_recursive(2, 16, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    /// TTL in seconds, from one second to one day.
    pub fn arb_ttl_secs() -> impl Strategy<Value = u64> {
        1u64..=86_400
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Ready-made stores on a manual clock.

    use super::*;
    use tempfile::TempDir;

    /// Keys that stay distinct after escaping under the protocol and flat file
    /// rules. The hierarchical file rules fold `/` into `|`.
    pub const STANDARD_KEY_CORPUS: &[&str] = &[
        "users",
        "users/1",
        "users/2",
        "users|1",
        "user-names",
        "user names",
        "posts/1/comments",
        "posts|1|comments",
        "key1|subkey1",
        "key1|subkey1|sskey1|ssskey1",
        "report 2024",
        "report_2025",
    ];

    pub fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(ManualClock::DEFAULT_EPOCH_SECS))
    }

    fn build(config: StoreConfig, clock: &Arc<ManualClock>) -> Store {
        build_store_with_clock(&config.with_prefix("test"), clock.clone())
            .expect("store construction should succeed")
    }

    /// In-process key/value store.
    pub fn memory_store() -> (Store, Arc<ManualClock>) {
        let clock = manual_clock();
        (build(StoreConfig::memory(), &clock), clock)
    }

    /// Flat file store; every key is one file.
    pub fn file_store() -> (Store, TempDir, Arc<ManualClock>) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = manual_clock();
        let store = build(StoreConfig::file(dir.path()), &clock);
        (store, dir, clock)
    }

    /// Nested file store; `|` opens a directory level.
    pub fn hierarchical_file_store() -> (Store, TempDir, Arc<ManualClock>) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = manual_clock();
        let store = build(StoreConfig::hierarchical_file(dir.path()), &clock);
        (store, dir, clock)
    }

    pub fn lmdb_store() -> (Store, TempDir, Arc<ManualClock>) {
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = manual_clock();
        let store = build(StoreConfig::lmdb(dir.path()), &clock);
        (store, dir, clock)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache lookups and key encoding.

    use super::*;
    use std::collections::HashMap;

    /// Assert that `key` holds `expected`.
    #[track_caller]
    pub fn assert_hit(store: &Store, key: &str, expected: &serde_json::Value) {
        match store.get::<serde_json::Value>(key) {
            Ok(Some(value)) => assert_eq!(&value, expected, "Wrong value under {key}"),
            other => panic!("Expected hit for {key}, got: {other:?}"),
        }
    }

    /// Assert that `key` is a miss.
    #[track_caller]
    pub fn assert_miss(store: &Store, key: &str) {
        match store.get::<serde_json::Value>(key) {
            Ok(None) => {}
            other => panic!("Expected miss for {key}, got: {other:?}"),
        }
    }

    /// Assert that a CairnResult is a Validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &CairnResult<T>) {
        match result {
            Err(CairnError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {other:?}"),
        }
    }

    /// Assert that no two raw keys map to the same storage key.
    #[track_caller]
    pub fn assert_no_collisions(codec: &KeyCodec, keys: &[&str]) {
        let mut seen: HashMap<String, &str> = HashMap::new();
        for raw in keys {
            let encoded = codec
                .item_key(raw)
                .unwrap_or_else(|e| panic!("Key {raw:?} failed to encode: {e}"));
            if let Some(previous) = seen.insert(encoded.clone(), *raw) {
                panic!("{previous:?} and {raw:?} both encode to {encoded:?}");
            }
        }
    }
}
