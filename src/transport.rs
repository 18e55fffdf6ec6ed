//! Byte-level transport interface.
//!
//! The transport is an external collaborator: it owns topic registration,
//! payload delivery and teardown, and hands this crate opaque byte payloads
//! plus delivery metadata. [`MemoryBus`](crate::memory::MemoryBus) implements
//! these traits in-process; real deployments bridge their bus of choice
//! behind the same seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Metadata accompanying every raw payload from the transport.
///
/// Carried into the decoded envelope verbatim, independent of whether the
/// payload decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryMetadata {
    /// Message id assigned on the publish side
    pub id: i64,
    /// Publish timestamp in milliseconds since epoch
    pub publish_time: i64,
    /// Logical write clock of the publisher
    pub clock: i64,
}

/// A raw payload plus its delivery metadata.
///
/// The payload is an opaque byte sequence. It is never routed through a
/// text codec; a publisher of UTF-16 garbage gets its bytes back unchanged.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    /// Encoded message bytes as received from the wire
    pub payload: Bytes,
    /// Transport-supplied delivery metadata
    pub meta: DeliveryMetadata,
}

/// Byte-level delivery callback, invoked on the transport's delivery thread.
pub type DeliveryCallback = Arc<dyn Fn(RawDelivery) + Send + Sync>;

/// A byte-level subscription handle owned by the transport.
///
/// One handle corresponds to one registered subscription on one topic.
/// The handle carries a single delivery-callback slot; fan-out to multiple
/// consumers is layered above it by [`Subscriber`](crate::subscriber::Subscriber).
#[async_trait]
pub trait RawSubscription: Send + Sync {
    /// Install the delivery callback. Replaces any previously installed one.
    fn set_delivery_callback(&self, callback: DeliveryCallback);

    /// Clear the delivery callback slot.
    ///
    /// No callback invocation begins after this returns; an invocation
    /// already running on the delivery thread may still complete.
    fn clear_delivery_callback(&self);

    /// Wait for the next raw payload.
    ///
    /// A `None` timeout waits indefinitely. `Ok(None)` means the timeout
    /// elapsed without data, which is not a fault.
    async fn receive_raw(&self, timeout: Option<Duration>) -> Result<Option<RawDelivery>>;

    /// Release the transport-side resources held by this subscription.
    fn close(&self);
}

/// A byte-oriented pub/sub transport.
pub trait Transport: Send + Sync {
    /// Register a subscription for `topic` and return its handle.
    fn subscribe(&self, topic: &str) -> Result<Box<dyn RawSubscription>>;
}
