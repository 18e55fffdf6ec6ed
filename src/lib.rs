//! Dynamic protobuf subscription for byte-oriented pub/sub transports.
//!
//! This library sits between a raw byte transport and application code that
//! wants structured protobuf messages without compiling message schemas
//! ahead of time. Given only a topic name, it resolves the topic's schema at
//! runtime from serialized descriptor-set bytes, builds a reusable decoder
//! exactly once, and decodes every incoming payload into a message plus its
//! delivery metadata.
//!
//! Features:
//!
//! - Runtime Protobuf Support: build decoders from serialized descriptor
//!   sets or .proto source and decode messages without code generation
//! - Lazy Schema Resolution: a subscription fetches its topic's schema from
//!   a metadata source on first use, exactly once, even under concurrent
//!   delivery
//! - Push and Pull Delivery: callback dispatch on the delivery thread, or
//!   awaiting receive with timeout, over one shared decoder
//! - Field Introspection: list fields and extract values from decoded
//!   messages dynamically, or render them as JSON

/// Subscription adapter: lazy decoder cache, callback registry, push and
/// pull delivery over one shared pipeline
pub mod subscriber;

/// Runtime protobuf schema registry and wire decoding
pub mod proto;

pub mod error;
pub mod memory;
pub mod metadata;
pub mod transport;

// Re-export main types for easy access
pub use error::{Error, Result};
pub use memory::MemoryBus;
pub use metadata::{StaticTopicMetadata, TopicMetadata};
pub use proto::decoder::{ProtoDecoder, ProtoFieldValue, ProtoMessage};
pub use proto::parser::{
    descriptor_set_from_source, ProtoFieldDescriptor, ProtoMessageDescriptor, ProtoSchema,
    ProtoType,
};
pub use subscriber::{
    BuildRetryPolicy, CallbackHandle, Envelope, MessageCallback, Subscriber, SubscriberOptions,
};
pub use transport::{DeliveryCallback, DeliveryMetadata, RawDelivery, RawSubscription, Transport};
