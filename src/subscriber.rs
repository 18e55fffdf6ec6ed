//! Dynamic subscription adapter.
//!
//! [`Subscriber`] bridges a byte-level transport subscription to the
//! decoding pipeline. The topic's decoder is built lazily, exactly once, on
//! the first delivery or receive call, from the descriptor bytes and type
//! name supplied by the [`TopicMetadata`] source. Every subsequent delivery
//! is decoded into an [`Envelope`] and either dispatched to the registered
//! callbacks (push mode) or returned from [`Subscriber::receive`] (pull
//! mode). Both modes share one decoder and may be used concurrently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::metadata::TopicMetadata;
use crate::proto::decoder::{ProtoDecoder, ProtoMessage};
use crate::proto::parser::ProtoSchema;
use crate::transport::{RawDelivery, RawSubscription, Transport};

/// A decoded message plus its delivery metadata.
///
/// A new envelope is constructed for every successful decode; deliveries
/// never alias or mutate an earlier envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Decoded message payload
    pub message: ProtoMessage,
    /// Message id assigned on the publish side
    pub id: i64,
    /// Publish timestamp in milliseconds since epoch
    pub publish_time: i64,
    /// Logical write clock of the publisher
    pub clock: i64,
}

/// Callback invoked with the topic name and the decoded envelope.
pub type MessageCallback = Arc<dyn Fn(&str, &Envelope) + Send + Sync>;

/// Identifies a registered callback for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

/// What to do with deliveries after a decoder build attempt fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildRetryPolicy {
    /// Retry the build on every subsequent delivery or receive call until it
    /// succeeds, e.g. because the topic's metadata had not propagated yet.
    #[default]
    RetryNextAttempt,
    /// Treat the first failure as terminal and drop all further deliveries.
    GiveUp,
}

/// Subscription options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriberOptions {
    pub build_retry: BuildRetryPolicy,
}

enum ParserState {
    Unbuilt,
    Ready(Arc<ProtoDecoder>),
    Failed(String),
}

struct Inner {
    topic: String,
    raw: Box<dyn RawSubscription>,
    metadata: Arc<dyn TopicMetadata>,
    options: SubscriberOptions,
    parser: Mutex<ParserState>,
    callbacks: Mutex<Vec<(CallbackHandle, MessageCallback)>>,
    next_handle: AtomicU64,
    push_installed: AtomicBool,
    closed: AtomicBool,
}

/// A subscription bound to one topic, decoding payloads with a lazily built
/// decoder.
///
/// Clones share the same subscription; closing one closes them all.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<Inner>,
}

impl Subscriber {
    /// Register a subscription for `topic` on `transport` with default
    /// options.
    pub fn connect(
        transport: &dyn Transport,
        metadata: Arc<dyn TopicMetadata>,
        topic: &str,
    ) -> Result<Self> {
        Self::connect_with(transport, metadata, topic, SubscriberOptions::default())
    }

    /// Register a subscription for `topic` on `transport`.
    pub fn connect_with(
        transport: &dyn Transport,
        metadata: Arc<dyn TopicMetadata>,
        topic: &str,
        options: SubscriberOptions,
    ) -> Result<Self> {
        let raw = transport.subscribe(topic)?;
        Ok(Self {
            inner: Arc::new(Inner {
                topic: topic.to_string(),
                raw,
                metadata,
                options,
                parser: Mutex::new(ParserState::Unbuilt),
                callbacks: Mutex::new(Vec::new()),
                next_handle: AtomicU64::new(1),
                push_installed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Topic this subscription is bound to.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Register a callback for decoded messages.
    ///
    /// Callbacks run synchronously on the transport's delivery thread, in
    /// registration order. A callback added during a dispatch takes effect
    /// from the next delivery.
    pub fn add_callback(
        &self,
        callback: impl Fn(&str, &Envelope) + Send + Sync + 'static,
    ) -> Result<CallbackHandle> {
        self.ensure_open()?;

        let handle = CallbackHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let callback: MessageCallback = Arc::new(callback);
        {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            callbacks.push((handle, callback));
        }

        self.install_push_handler();
        Ok(handle)
    }

    /// Remove a previously registered callback.
    ///
    /// Once this returns, the callback will not run for any delivery whose
    /// processing begins afterwards. Returns whether the handle was still
    /// registered.
    pub fn remove_callback(&self, handle: CallbackHandle) -> Result<bool> {
        self.ensure_open()?;

        let mut callbacks = self
            .inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = callbacks.len();
        callbacks.retain(|(h, _)| *h != handle);
        Ok(callbacks.len() != before)
    }

    /// Wait for the next message and decode it.
    ///
    /// A `None` timeout waits indefinitely. Returns `Ok(None)` when the
    /// timeout elapses without data or when the received payload failed to
    /// decode (the failure is logged and the subscription stays usable).
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<Envelope>> {
        self.ensure_open()?;

        let Some(delivery) = self.inner.raw.receive_raw(timeout).await? else {
            return Ok(None);
        };

        let decoder = match self.inner.ensure_decoder() {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::warn!(topic = %self.inner.topic, error = %e, "decoder unavailable, dropping received payload");
                return Ok(None);
            }
        };

        match decode_delivery(&decoder, &delivery) {
            Ok(envelope) => Ok(Some(envelope)),
            Err(e) => {
                tracing::warn!(topic = %self.inner.topic, error = %e, "dropping undecodable payload");
                Ok(None)
            }
        }
    }

    /// Close the subscription.
    ///
    /// Unregisters from the transport first (no further deliveries begin),
    /// then clears the callback registry, then releases the transport
    /// handle. Every operation afterwards, including a second `close`,
    /// fails with [`Error::Closed`].
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }

        self.inner.raw.clear_delivery_callback();
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.inner.raw.close();
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Install the single internal byte-level callback on the transport.
    fn install_push_handler(&self) {
        if self.inner.push_installed.swap(true, Ordering::AcqRel) {
            return;
        }

        // The transport holds this closure until close; a weak reference
        // keeps the subscription collectable if the caller forgets to close.
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .raw
            .set_delivery_callback(Arc::new(move |delivery| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_delivery(delivery);
                }
            }));
    }
}

impl Inner {
    /// Push-mode pipeline, run synchronously on the transport's delivery
    /// thread.
    fn handle_delivery(&self, delivery: RawDelivery) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }

        let decoder = match self.ensure_decoder() {
            Ok(decoder) => decoder,
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "decoder unavailable, dropping delivery");
                return;
            }
        };

        let envelope = match decode_delivery(&decoder, &delivery) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "dropping undecodable delivery");
                return;
            }
        };

        // Dispatch on a snapshot of the registry: callbacks may add or
        // remove callbacks, or close the subscription, without deadlocking,
        // and a concurrent removal is not blocked by the dispatch.
        let snapshot: Vec<MessageCallback> = {
            let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in snapshot {
            callback(&self.topic, &envelope);
        }
    }

    /// Return the cached decoder, building it if this is the first need.
    ///
    /// The cell mutex is held across the build: a thread losing the
    /// first-use race blocks here and then reuses the winner's result, so
    /// the build runs at most once per success.
    fn ensure_decoder(&self) -> Result<Arc<ProtoDecoder>> {
        let mut state = self.parser.lock().unwrap_or_else(|e| e.into_inner());

        match &*state {
            ParserState::Ready(decoder) => return Ok(Arc::clone(decoder)),
            ParserState::Failed(reason) => {
                if self.options.build_retry == BuildRetryPolicy::GiveUp {
                    return Err(Error::Schema(format!(
                        "decoder build permanently failed: {reason}"
                    )));
                }
                tracing::debug!(topic = %self.topic, "retrying decoder build after earlier failure");
            }
            ParserState::Unbuilt => {}
        }

        match self.build_decoder() {
            Ok(decoder) => {
                *state = ParserState::Ready(Arc::clone(&decoder));
                Ok(decoder)
            }
            Err(e) => {
                *state = ParserState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn build_decoder(&self) -> Result<Arc<ProtoDecoder>> {
        let descriptor = self.metadata.topic_descriptor(&self.topic)?;
        let type_name = self.metadata.topic_type_name(&self.topic)?;

        // Wire form is `prefix:FullName`; the lookup key follows the first
        // separator. A name without separator is used verbatim.
        let lookup = type_name
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or(&type_name);

        let schema = ProtoSchema::from_descriptor_set_bytes(&descriptor)?;
        Ok(Arc::new(ProtoDecoder::for_type(schema, lookup)?))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Safety net for subscriptions dropped without close
        if !self.closed.load(Ordering::Acquire) {
            self.raw.clear_delivery_callback();
            self.raw.close();
        }
    }
}

fn decode_delivery(decoder: &ProtoDecoder, delivery: &RawDelivery) -> Result<Envelope> {
    let message: ProtoMessage = decoder.decode(&delivery.payload)?;
    Ok(Envelope {
        message,
        id: delivery.meta.id,
        publish_time: delivery.meta.publish_time,
        clock: delivery.meta.clock,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBus;
    use crate::metadata::StaticTopicMetadata;
    use crate::proto::parser::descriptor_set_from_source;

    fn metadata_for(topic: &str, proto: &str, type_name: &str) -> Arc<StaticTopicMetadata> {
        let metadata = Arc::new(StaticTopicMetadata::new());
        let bytes = descriptor_set_from_source(proto).expect("Failed to build descriptor set");
        metadata.insert(topic, bytes, type_name);
        metadata
    }

    const COUNTER_PROTO: &str = r#"
        syntax = "proto3";

        message Counter {
            int64 n = 1;
        }
    "#;

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let bus = MemoryBus::new();
        let metadata = metadata_for("t", COUNTER_PROTO, "Counter");
        let sub = Subscriber::connect(&bus, metadata, "t").expect("connect failed");

        sub.close().expect("close failed");

        assert!(matches!(sub.close(), Err(Error::Closed)));
        assert!(matches!(sub.add_callback(|_, _| {}), Err(Error::Closed)));
        assert!(matches!(
            sub.receive(Some(Duration::from_millis(1))).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn test_callback_handles_are_unique() {
        let bus = MemoryBus::new();
        let metadata = metadata_for("t", COUNTER_PROTO, "Counter");
        let sub = Subscriber::connect(&bus, metadata, "t").expect("connect failed");

        let a = sub.add_callback(|_, _| {}).expect("add failed");
        let b = sub.add_callback(|_, _| {}).expect("add failed");
        assert_ne!(a, b);

        assert!(sub.remove_callback(a).expect("remove failed"));
        // Second removal of the same handle is a no-op
        assert!(!sub.remove_callback(a).expect("remove failed"));
    }

    #[tokio::test]
    async fn test_type_name_without_separator() {
        let bus = MemoryBus::new();
        // Lookup key is the whole name when there is no prefix
        let metadata = metadata_for("t", COUNTER_PROTO, "Counter");
        let sub = Subscriber::connect(&bus, metadata, "t").expect("connect failed");

        bus.publish("t", vec![0x08, 0x05]);
        let envelope = sub
            .receive(Some(Duration::from_millis(100)))
            .await
            .expect("receive failed")
            .expect("no envelope");
        assert_eq!(
            envelope.message.get_field("n"),
            Some(&crate::proto::decoder::ProtoFieldValue::Int64(5))
        );
    }
}
