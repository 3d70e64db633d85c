//! Fuzz test for storage key encoding
//!
//! Feeds arbitrary strings through every rule family and checks that:
//! - Encoding never panics
//! - A successful encoding only contains characters the rules allow
//! - Every storage key starts with the hierarchy separator
//!
//! Run with: cargo +nightly fuzz run key_codec_fuzz -- -max_total_time=60

#![no_main]

use cairn_core::{KeyCodec, KeyRules};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    // First line is the prefix, the rest is the key
    let (prefix, raw) = input.split_once('\n').unwrap_or(("app", input));

    for rules in [KeyRules::Protocol, KeyRules::FlatFile, KeyRules::HierarchicalFile] {
        let codec = KeyCodec::new(rules, prefix);
        assert!(codec.prefix().starts_with(rules.separator()));

        if let Ok(escaped) = codec.fix_item_key(raw) {
            assert!(!escaped.is_empty());
            assert!(escaped.chars().all(|c| rules.allows(c)));

            let storage_key = codec.item_key(raw).expect("escaping already succeeded");
            assert!(storage_key.ends_with(&escaped));
        }
    }
});
