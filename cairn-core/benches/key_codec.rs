use cairn_core::{compute_key_hash, KeyCodec, KeyRules};
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

const KEYS: &[&str] = &[
    "users",
    "users|42|profile",
    r"key1|subkey/sskey\ssskey",
    "reports/2024/q3-summary",
    "session:abc@host",
];

fn bench_item_key(c: &mut Criterion) {
    for rules in [KeyRules::Protocol, KeyRules::FlatFile, KeyRules::HierarchicalFile] {
        let codec = KeyCodec::new(rules, "bench-app");
        c.bench_function(&format!("key_codec/item_key/{:?}", rules), |b| {
            b.iter(|| {
                for key in KEYS {
                    let encoded = codec.item_key(black_box(key)).expect("encode key");
                    black_box(encoded);
                }
            });
        });
    }
}

fn bench_key_hash(c: &mut Criterion) {
    c.bench_function("key_codec/hierarchy_hash", |b| {
        b.iter(|| {
            let hash = compute_key_hash(black_box("path!root!3!!app!2!!users!0!"));
            black_box(hash);
        });
    });
}

criterion_group!(benches, bench_item_key, bench_key_hash);
criterion_main!(benches);
