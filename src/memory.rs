//! In-memory transport.
//!
//! [`MemoryBus`] implements the byte-level transport traits in-process: each
//! topic fans published payloads out to its registered subscriptions, with a
//! bounded queue per subscription for the pull path and synchronous
//! delivery-callback dispatch on the publisher's task for the push path.
//! It backs the integration tests and suits embedders that want an
//! in-process bus behind the same seam as a networked one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::transport::{
    DeliveryCallback, DeliveryMetadata, RawDelivery, RawSubscription, Transport,
};

const DEFAULT_QUEUE_CAPACITY: usize = 128;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct TopicState {
    /// Write clock: increments on every publish to this topic
    clock: i64,
    subscribers: Vec<Arc<SubState>>,
}

struct SubState {
    callback: Mutex<Option<DeliveryCallback>>,
    /// `None` once the subscription is closed; dropping the sender wakes a
    /// blocked receiver.
    queue_tx: Mutex<Option<mpsc::Sender<RawDelivery>>>,
    queue_rx: AsyncMutex<mpsc::Receiver<RawDelivery>>,
    closed: AtomicBool,
}

struct BusInner {
    topics: Mutex<HashMap<String, TopicState>>,
    next_id: AtomicI64,
    queue_capacity: usize,
}

/// In-process pub/sub bus.
///
/// Clones share the same topic space, so a publisher half and a subscriber
/// half can live on different tasks.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Bus whose per-subscription pull queues hold at most `capacity`
    /// deliveries; beyond that, new deliveries to a slow subscriber are
    /// dropped with a warning.
    pub fn with_queue_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                queue_capacity: capacity.max(1),
            }),
        }
    }

    /// Publish a payload to `topic`, returning the delivery metadata it was
    /// assigned.
    ///
    /// Delivery callbacks of matching subscriptions run synchronously on the
    /// caller's task before this returns.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> DeliveryMetadata {
        let payload = payload.into();

        let (meta, subscribers) = {
            let mut topics = self.inner.topics.lock().unwrap_or_else(|e| e.into_inner());
            let state = topics.entry(topic.to_string()).or_insert_with(|| TopicState {
                clock: 0,
                subscribers: Vec::new(),
            });
            state.clock += 1;
            // Prune subscriptions that were closed since the last publish
            state.subscribers.retain(|s| !s.closed.load(Ordering::Acquire));

            let meta = DeliveryMetadata {
                id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
                publish_time: now_ms(),
                clock: state.clock,
            };
            (meta, state.subscribers.clone())
        };

        // Dispatch outside the topics lock: a callback may subscribe,
        // publish or close without deadlocking.
        for sub in subscribers {
            if sub.closed.load(Ordering::Acquire) {
                continue;
            }
            let delivery = RawDelivery {
                payload: payload.clone(),
                meta,
            };

            let callback = sub
                .callback
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(callback) = callback {
                callback(delivery.clone());
            }

            let tx = sub
                .queue_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(tx) = tx {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(delivery) {
                    tracing::warn!(topic, "subscriber queue full, dropping delivery");
                }
            }
        }

        meta
    }
}

impl Transport for MemoryBus {
    fn subscribe(&self, topic: &str) -> Result<Box<dyn RawSubscription>> {
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let state = Arc::new(SubState {
            callback: Mutex::new(None),
            queue_tx: Mutex::new(Some(tx)),
            queue_rx: AsyncMutex::new(rx),
            closed: AtomicBool::new(false),
        });

        let mut topics = self.inner.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState {
                clock: 0,
                subscribers: Vec::new(),
            })
            .subscribers
            .push(Arc::clone(&state));

        Ok(Box::new(MemorySubscription { state }))
    }
}

/// Handle for one registered subscription on a [`MemoryBus`] topic.
pub struct MemorySubscription {
    state: Arc<SubState>,
}

#[async_trait]
impl RawSubscription for MemorySubscription {
    fn set_delivery_callback(&self, callback: DeliveryCallback) {
        let mut slot = self.state.callback.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(callback);
    }

    fn clear_delivery_callback(&self) {
        let mut slot = self.state.callback.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    async fn receive_raw(&self, timeout: Option<Duration>) -> Result<Option<RawDelivery>> {
        if self.state.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }

        let mut rx = self.state.queue_rx.lock().await;
        match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx.recv()).await {
                Ok(Some(delivery)) => Ok(Some(delivery)),
                // Sender dropped: the subscription was closed underneath us
                Ok(None) => Err(Error::Closed),
                // Timeout elapsed without data: not a fault
                Err(_) => Ok(None),
            },
            None => match rx.recv().await {
                Some(delivery) => Ok(Some(delivery)),
                None => Err(Error::Closed),
            },
        }
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state
            .callback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        // Drop the sender so a blocked receive_raw wakes up
        self.state
            .queue_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_publish_receive_round_trip() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("sensors").expect("subscribe failed");

        let meta = bus.publish("sensors", vec![1u8, 2, 3]);

        let delivery = sub
            .receive_raw(Some(Duration::from_millis(100)))
            .await
            .expect("receive failed")
            .expect("no delivery");
        assert_eq!(delivery.payload.as_ref(), &[1, 2, 3]);
        assert_eq!(delivery.meta, meta);
    }

    #[tokio::test]
    async fn test_clock_and_id_advance() {
        let bus = MemoryBus::new();
        let _sub = bus.subscribe("ticks").expect("subscribe failed");

        let first = bus.publish("ticks", vec![0u8]);
        let second = bus.publish("ticks", vec![0u8]);

        assert_eq!(second.clock, first.clock + 1);
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_receive_timeout_elapses() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("quiet").expect("subscribe failed");

        let got = sub
            .receive_raw(Some(Duration::from_millis(20)))
            .await
            .expect("receive failed");
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_delivery_callback_runs_on_publish() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("events").expect("subscribe failed");

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        sub.set_delivery_callback(Arc::new(move |delivery| {
            assert_eq!(delivery.payload.as_ref(), b"ping");
            seen_cb.fetch_add(1, Ordering::SeqCst);
        }));

        bus.publish("events", &b"ping"[..]);
        bus.publish("events", &b"ping"[..]);
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        sub.clear_delivery_callback();
        bus.publish("events", &b"ping"[..]);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_new_deliveries() {
        let bus = MemoryBus::with_queue_capacity(2);
        let sub = bus.subscribe("burst").expect("subscribe failed");

        for i in 0..5u8 {
            bus.publish("burst", vec![i]);
        }

        // Only the first two fit in the queue
        let a = sub.receive_raw(Some(Duration::from_millis(20))).await.unwrap();
        let b = sub.receive_raw(Some(Duration::from_millis(20))).await.unwrap();
        let c = sub.receive_raw(Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(a.unwrap().payload.as_ref(), &[0]);
        assert_eq!(b.unwrap().payload.as_ref(), &[1]);
        assert!(c.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_receiver() {
        let bus = MemoryBus::new();
        let sub: Arc<dyn RawSubscription> =
            Arc::from(bus.subscribe("idle").expect("subscribe failed"));

        let sub_task = Arc::clone(&sub);
        let waiter = tokio::spawn(async move { sub_task.receive_raw(None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        sub.close();

        let result = waiter.await.expect("task panicked");
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_closed_subscription_not_delivered() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("gone").expect("subscribe failed");

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        sub.set_delivery_callback(Arc::new(move |_| {
            seen_cb.fetch_add(1, Ordering::SeqCst);
        }));

        sub.close();
        bus.publish("gone", vec![1u8]);
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
