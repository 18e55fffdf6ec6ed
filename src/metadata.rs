//! Topic metadata source.
//!
//! Supplies, per topic, the serialized descriptor set and the wire type name
//! that the subscription needs to build its decoder. In a full deployment
//! this is backed by the bus's topic-discovery machinery; the
//! [`StaticTopicMetadata`] implementation here is map-backed and suits tests
//! and embedders that register schemas up front.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};

/// Source of per-topic schema information.
///
/// `topic_type_name` returns the wire form `prefix:FullName` (for example
/// `proto:pkg.Quote`); only the segment after the first `:` is the registry
/// lookup key.
pub trait TopicMetadata: Send + Sync {
    /// Serialized `FileDescriptorSet` bytes for the topic's message type.
    fn topic_descriptor(&self, topic: &str) -> Result<Vec<u8>>;

    /// Wire type name of the topic's message type.
    fn topic_type_name(&self, topic: &str) -> Result<String>;
}

struct TopicEntry {
    descriptor: Vec<u8>,
    type_name: String,
}

/// Map-backed metadata source.
///
/// Entries may be inserted or replaced at any time, so a subscription whose
/// first build failed can pick up corrected metadata on its next attempt.
#[derive(Default)]
pub struct StaticTopicMetadata {
    entries: RwLock<HashMap<String, TopicEntry>>,
}

impl StaticTopicMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the schema information for `topic`.
    pub fn insert(&self, topic: &str, descriptor: Vec<u8>, type_name: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            topic.to_string(),
            TopicEntry {
                descriptor,
                type_name: type_name.to_string(),
            },
        );
    }

    /// Drop the entry for `topic`, if any.
    pub fn remove(&self, topic: &str) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(topic);
    }
}

impl TopicMetadata for StaticTopicMetadata {
    fn topic_descriptor(&self, topic: &str) -> Result<Vec<u8>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(topic)
            .map(|e| e.descriptor.clone())
            .ok_or_else(|| Error::Metadata(format!("no descriptor registered for topic '{topic}'")))
    }

    fn topic_type_name(&self, topic: &str) -> Result<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(topic)
            .map(|e| e.type_name.clone())
            .ok_or_else(|| Error::Metadata(format!("no type name registered for topic '{topic}'")))
    }
}
