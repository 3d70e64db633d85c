//! Storage key encoding.
//!
//! Every logical key passes through a [`KeyCodec`] before it reaches a
//! backend. The codec escapes characters the backend cannot store and
//! prepends the store prefix. Tag names use the same codec.
//!
//! ```text
//! logical key                   rules              storage key (prefix "app")
//! ---------------------------   ----------------   ----------------------------------
//! key1|subkey/sskey\ssskey      Protocol           |app|key1|subkey-sskey-ssskey
//! key1|subkey/sskey\ssskey      FlatFile           _app_key1_pipe_subkey_ds_sskey_ssskey
//! key1|subkey/sskey\ssskey      HierarchicalFile   |app|key1|subkey|sskey_ssskey
//! ```
//!
//! Escaping is not injective: `a-b` and `a_dash_b` share a file storage key.

use crate::error::{CairnResult, ValidationError};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static PROTOCOL_RESERVED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[{}()/@:\\]").expect("Invalid protocol reserved regex"));
static FILE_PREFIX_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_.! ]+").expect("Invalid file prefix regex"));
static DASHES: Lazy<Regex> = Lazy::new(|| Regex::new(r"-+").expect("Invalid dash regex"));
static PIPES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\|+").expect("Invalid pipe regex"));
static SLASHES: Lazy<Regex> = Lazy::new(|| Regex::new(r"/+").expect("Invalid slash regex"));
static PATH_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[/|]+").expect("Invalid path separator regex"));
static HIERARCHICAL_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-zA-Z0-9_.! |]+").expect("Invalid hierarchical key regex"));

/// Escaping rule family, one per kind of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRules {
    /// Network and embedded key/value stores (redis, memcached, lmdb, memory).
    Protocol,
    /// One file per key, no nesting.
    FlatFile,
    /// One directory level per hierarchy segment.
    HierarchicalFile,
}

impl KeyRules {
    /// Hierarchy separator for this rule family.
    pub fn separator(self) -> char {
        match self {
            KeyRules::Protocol | KeyRules::HierarchicalFile => '|',
            KeyRules::FlatFile => '_',
        }
    }

    /// True when `c` may appear in an escaped storage key.
    pub fn allows(self, c: char) -> bool {
        match self {
            KeyRules::Protocol => !matches!(c, '{' | '}' | '(' | ')' | '/' | '\\' | '@' | ':'),
            KeyRules::FlatFile => c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '!' | ' '),
            KeyRules::HierarchicalFile => {
                c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '!' | ' ' | '|')
            }
        }
    }

    fn escape_prefix(self, prefix: &str) -> String {
        match self {
            KeyRules::Protocol => PROTOCOL_RESERVED.replace_all(prefix, "_").into_owned(),
            KeyRules::FlatFile | KeyRules::HierarchicalFile => {
                FILE_PREFIX_INVALID.replace_all(prefix, "_").into_owned()
            }
        }
    }

    fn escape_key(self, raw: &str) -> String {
        match self {
            KeyRules::Protocol => {
                let trimmed = raw.trim_start_matches('|');
                PROTOCOL_RESERVED.replace_all(trimmed, "-").into_owned()
            }
            KeyRules::FlatFile => {
                let key = DASHES.replace_all(raw, "_dash_");
                let key = PIPES.replace_all(&key, "_pipe_");
                let key = SLASHES.replace_all(&key, "_ds_");
                let key = FILE_PREFIX_INVALID.replace_all(&key, "_");
                key.trim_start_matches('_').to_string()
            }
            KeyRules::HierarchicalFile => {
                let key = DASHES.replace_all(raw, "_dash_");
                let key = PATH_SEPARATORS.replace_all(&key, "|");
                let key = HIERARCHICAL_INVALID.replace_all(&key, "_");
                key.trim_start_matches('|').to_string()
            }
        }
    }
}

/// Maps logical keys and tag names to backend-legal storage keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    rules: KeyRules,
    prefix: String,
}

impl KeyCodec {
    /// Build a codec; the store prefix becomes `sep + escaped(prefix) + sep`.
    pub fn new(rules: KeyRules, prefix: &str) -> Self {
        let sep = rules.separator();
        let escaped = rules.escape_prefix(prefix);
        let prefix = if escaped.is_empty() {
            sep.to_string()
        } else {
            format!("{sep}{escaped}{sep}")
        };
        Self { rules, prefix }
    }

    pub fn rules(&self) -> KeyRules {
        self.rules
    }

    /// The full store prefix, separators included.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn separator(&self) -> char {
        self.rules.separator()
    }

    /// Escape a raw key without the store prefix.
    pub fn fix_item_key(&self, raw: &str) -> CairnResult<String> {
        if raw.is_empty() {
            return Err(ValidationError::EmptyKey.into());
        }
        let escaped = self.rules.escape_key(raw);
        if escaped.is_empty() {
            return Err(ValidationError::InvalidKey {
                key: raw.to_string(),
                reason: "key is empty after escaping".to_string(),
            }
            .into());
        }
        if let Some(bad) = escaped.chars().find(|c| !self.rules.allows(*c)) {
            return Err(ValidationError::InvalidKey {
                key: raw.to_string(),
                reason: format!("character {bad:?} is not allowed"),
            }
            .into());
        }
        Ok(escaped)
    }

    /// Prefixed storage key for a logical key.
    pub fn item_key(&self, raw: &str) -> CairnResult<String> {
        Ok(format!("{}{}", self.prefix, self.fix_item_key(raw)?))
    }

    /// Prefixed storage key for a tag name.
    pub fn tag_key(&self, name: &str) -> CairnResult<String> {
        self.item_key(name)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CairnError;
    use proptest::prelude::*;
    use std::collections::HashSet;

    const RESERVED: &str = r"key1|subkey/sskey\ssskey";

    #[test]
    fn test_protocol_escaping() {
        let codec = KeyCodec::new(KeyRules::Protocol, "app");
        assert_eq!(codec.prefix(), "|app|");
        assert_eq!(
            codec.item_key(RESERVED).unwrap(),
            "|app|key1|subkey-sskey-ssskey"
        );
        assert_eq!(codec.item_key("|lead").unwrap(), "|app|lead");
        assert_eq!(codec.item_key("user@host:1").unwrap(), "|app|user-host-1");
    }

    #[test]
    fn test_flat_file_escaping() {
        let codec = KeyCodec::new(KeyRules::FlatFile, "app");
        assert_eq!(codec.prefix(), "_app_");
        assert_eq!(
            codec.item_key(RESERVED).unwrap(),
            "_app_key1_pipe_subkey_ds_sskey_ssskey"
        );
        assert_eq!(codec.item_key("a--b").unwrap(), "_app_a_dash_b");
        assert_eq!(codec.item_key("_x").unwrap(), "_app_x");
    }

    #[test]
    fn test_hierarchical_file_escaping() {
        let codec = KeyCodec::new(KeyRules::HierarchicalFile, "app");
        assert_eq!(codec.prefix(), "|app|");
        assert_eq!(
            codec.item_key(RESERVED).unwrap(),
            "|app|key1|subkey|sskey_ssskey"
        );
        assert_eq!(codec.item_key("a//b||c").unwrap(), "|app|a|b|c");
        assert_eq!(codec.item_key("a-b").unwrap(), "|app|a_dash_b");
    }

    #[test]
    fn test_prefix_escaping_uses_underscore() {
        let protocol = KeyCodec::new(KeyRules::Protocol, "my/app:1");
        assert_eq!(protocol.prefix(), "|my_app_1|");

        let file = KeyCodec::new(KeyRules::HierarchicalFile, "my-app|x");
        assert_eq!(file.prefix(), "|my_app_x|");
    }

    #[test]
    fn test_empty_prefix_is_bare_separator() {
        let codec = KeyCodec::new(KeyRules::Protocol, "");
        assert_eq!(codec.prefix(), "|");
        assert_eq!(codec.item_key("a|b").unwrap(), "|a|b");
    }

    #[test]
    fn test_empty_key_rejected() {
        let codec = KeyCodec::new(KeyRules::Protocol, "app");
        assert!(matches!(
            codec.item_key(""),
            Err(CairnError::Validation(ValidationError::EmptyKey))
        ));
        assert!(matches!(
            codec.item_key("|||"),
            Err(CairnError::Validation(ValidationError::InvalidKey { .. }))
        ));
    }

    #[test]
    fn test_tag_key_matches_item_key() {
        let codec = KeyCodec::new(KeyRules::HierarchicalFile, "app");
        assert_eq!(codec.tag_key("tag1").unwrap(), codec.item_key("tag1").unwrap());
    }

    #[test]
    fn test_realistic_corpus_has_no_collisions() {
        let corpus = [
            "users",
            "users|1",
            "users|1|profile",
            "users/1",
            "user-names",
            "users 1",
            "users|2",
            "reports/2024/summary",
            "reports|2024|summary",
            "session abc",
            "session-abc",
        ];
        for rules in [KeyRules::Protocol, KeyRules::FlatFile] {
            let codec = KeyCodec::new(rules, "app");
            let keys: HashSet<String> =
                corpus.iter().map(|k| codec.item_key(k).unwrap()).collect();
            assert_eq!(keys.len(), corpus.len(), "collision under {:?}", rules);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_escaped_keys_stay_in_alphabet(raw in "[ -~]{1,40}") {
            for rules in [KeyRules::Protocol, KeyRules::FlatFile, KeyRules::HierarchicalFile] {
                let codec = KeyCodec::new(rules, "app");
                if let Ok(key) = codec.fix_item_key(&raw) {
                    prop_assert!(key.chars().all(|c| rules.allows(c)));
                    prop_assert!(!key.is_empty());
                }
            }
        }

        #[test]
        fn prop_storage_keys_start_with_separator(raw in "[a-z0-9|/-]{1,20}[a-z]") {
            for rules in [KeyRules::Protocol, KeyRules::FlatFile, KeyRules::HierarchicalFile] {
                let codec = KeyCodec::new(rules, "app");
                let key = codec.item_key(&raw).unwrap();
                prop_assert!(key.starts_with(rules.separator()));
            }
        }
    }
}
