//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dynsub::{descriptor_set_from_source, Result, StaticTopicMetadata, TopicMetadata};

/// Initialize tracing for debug output. Safe to call from every test.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("dynsub=debug")
        .try_init()
        .ok();
}

/// Minimal single-field message: `Foo { int32 x = 1; }`, no package.
pub const FOO_PROTO: &str = r#"
    syntax = "proto3";

    message Foo {
        int32 x = 1;
    }
"#;

/// Metadata source preloaded with one topic's schema.
pub fn metadata_for(topic: &str, proto: &str, type_name: &str) -> Arc<StaticTopicMetadata> {
    let metadata = Arc::new(StaticTopicMetadata::new());
    let bytes = descriptor_set_from_source(proto).expect("Failed to build descriptor set");
    metadata.insert(topic, bytes, type_name);
    metadata
}

/// Encode a varint-typed field (int32/int64/uint*/bool/enum).
///
/// Field numbers up to 15 only, which keeps the tag a single byte.
pub fn encode_varint_field(field_number: u32, value: u64) -> Vec<u8> {
    assert!(field_number < 16);
    let mut out = vec![(field_number << 3) as u8];
    let mut v = value;
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

/// Encode a length-delimited field (string/bytes/nested message).
pub fn encode_len_field(field_number: u32, payload: &[u8]) -> Vec<u8> {
    assert!(field_number < 16);
    assert!(payload.len() < 128);
    let mut out = vec![(field_number << 3 | 2) as u8, payload.len() as u8];
    out.extend_from_slice(payload);
    out
}

/// Encoded `Foo` payload with the given `x`.
pub fn encode_foo(x: u64) -> Vec<u8> {
    encode_varint_field(1, x)
}

/// Metadata source that counts descriptor fetches, to observe how often the
/// decoder build runs.
pub struct CountingMetadata {
    inner: StaticTopicMetadata,
    fetches: AtomicUsize,
}

impl CountingMetadata {
    pub fn new() -> Self {
        Self {
            inner: StaticTopicMetadata::new(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn insert(&self, topic: &str, descriptor: Vec<u8>, type_name: &str) {
        self.inner.insert(topic, descriptor, type_name);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl TopicMetadata for CountingMetadata {
    fn topic_descriptor(&self, topic: &str) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.inner.topic_descriptor(topic)
    }

    fn topic_type_name(&self, topic: &str) -> Result<String> {
        self.inner.topic_type_name(topic)
    }
}
