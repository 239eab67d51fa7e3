//! In-process broker with per-group offsets.
//!
//! Topics are append-only logs kept for the lifetime of the broker. Each
//! consumer group has one committed position per topic, advanced when a
//! message is handed out. Fault injection hooks let tests drive the
//! failure paths of the publisher and the consumer.

use super::{decode_payload, Broker, Subscription};
use crate::config::OffsetReset;
use crate::errors::{ConsumeTransportError, PublishError};
use crate::metrics::SubscriptionGauge;
use crate::model::Ack;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<u8>>>,
    offsets: HashMap<(String, String), usize>,
    unavailable: bool,
    poll_failures: VecDeque<String>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    appended: Notify,
    open: AtomicUsize,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
    offset_reset: OffsetReset,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset_reset(offset_reset: OffsetReset) -> Self {
        Self {
            inner: Arc::default(),
            offset_reset,
        }
    }

    /// While unavailable, sends and subscribes fail and open
    /// subscriptions fail their next poll.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.state().unavailable = unavailable;
        self.inner.appended.notify_waiters();
    }

    /// Makes the next poll on any subscription fail with `reason`.
    pub fn fail_next_poll(&self, reason: impl Into<String>) {
        self.inner.state().poll_failures.push_back(reason.into());
        self.inner.appended.notify_waiters();
    }

    /// Appends raw bytes without going through the publisher.
    pub fn append_raw(&self, topic: &str, payload: Vec<u8>) -> u64 {
        let offset = {
            let mut state = self.inner.state();
            let log = state.topics.entry(topic.to_string()).or_default();
            log.push(payload);
            (log.len() - 1) as u64
        };
        self.inner.appended.notify_waiters();
        offset
    }

    /// Number of messages retained on `topic`.
    pub fn len(&self, topic: &str) -> usize {
        self.inner.state().topics.get(topic).map_or(0, Vec::len)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Committed position of `group_id` on `topic`, if the group has subscribed.
    pub fn committed(&self, topic: &str, group_id: &str) -> Option<usize> {
        self.inner
            .state()
            .offsets
            .get(&(topic.to_string(), group_id.to_string()))
            .copied()
    }

    /// Subscriptions opened and not yet released.
    pub fn open_subscriptions(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    type Subscription = MemorySubscription;

    async fn send(&self, topic: &str, payload: Vec<u8>) -> Result<Ack, PublishError> {
        if self.inner.state().unavailable {
            return Err(PublishError::Broker("broker unavailable".to_string()));
        }
        let delivery_id = self.append_raw(topic, payload);
        Ok(Ack {
            topic: topic.to_string(),
            delivery_id,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<MemorySubscription, ConsumeTransportError> {
        {
            let mut state = self.inner.state();
            if state.unavailable {
                return Err(ConsumeTransportError::Subscribe(
                    "broker unavailable".to_string(),
                ));
            }
            let start = match self.offset_reset {
                OffsetReset::Earliest => 0,
                OffsetReset::Latest => state.topics.get(topic).map_or(0, Vec::len),
            };
            state
                .offsets
                .entry((topic.to_string(), group_id.to_string()))
                .or_insert(start);
        }

        self.inner.open.fetch_add(1, Ordering::SeqCst);
        debug!(topic, group_id, "Opened in-memory subscription");

        Ok(MemorySubscription {
            inner: Arc::clone(&self.inner),
            key: (topic.to_string(), group_id.to_string()),
            released: false,
            _gauge: SubscriptionGauge::acquire(),
        })
    }

    async fn shutdown(&self) {
        self.set_unavailable(true);
    }
}

#[derive(Debug)]
pub struct MemorySubscription {
    inner: Arc<Inner>,
    key: (String, String),
    released: bool,
    _gauge: SubscriptionGauge,
}

impl MemorySubscription {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.inner.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn try_take(&self) -> Result<Option<Vec<u8>>, ConsumeTransportError> {
        let mut state = self.inner.state();
        if let Some(reason) = state.poll_failures.pop_front() {
            return Err(ConsumeTransportError::Connection(reason));
        }
        if state.unavailable {
            return Err(ConsumeTransportError::Connection(
                "broker unavailable".to_string(),
            ));
        }

        let offset = state.offsets.get(&self.key).copied().unwrap_or(0);
        let next = state
            .topics
            .get(&self.key.0)
            .and_then(|log| log.get(offset))
            .cloned();
        if next.is_some() {
            state.offsets.insert(self.key.clone(), offset + 1);
        }
        Ok(next)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<String>, ConsumeTransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so an append between the check and
            // the wait is not missed.
            let appended = self.inner.appended.notified();
            if let Some(payload) = self.try_take()? {
                return decode_payload(&payload).map(Some);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn close(mut self) {
        self.release();
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "telemetry-topic";

    #[test]
    fn test_groups_track_offsets_independently() {
        tokio_test::block_on(async {
            let broker = InMemoryBroker::new();
            broker.send(TOPIC, b"one".to_vec()).await.unwrap();
            broker.send(TOPIC, b"two".to_vec()).await.unwrap();

            let mut a = broker.subscribe(TOPIC, "a").await.unwrap();
            assert_eq!(a.poll(Duration::ZERO).await.unwrap().as_deref(), Some("one"));
            a.close().await;

            let mut a = broker.subscribe(TOPIC, "a").await.unwrap();
            assert_eq!(a.poll(Duration::ZERO).await.unwrap().as_deref(), Some("two"));
            a.close().await;

            let mut b = broker.subscribe(TOPIC, "b").await.unwrap();
            assert_eq!(b.poll(Duration::ZERO).await.unwrap().as_deref(), Some("one"));
            b.close().await;

            assert_eq!(broker.committed(TOPIC, "a"), Some(2));
            assert_eq!(broker.committed(TOPIC, "b"), Some(1));
        });
    }

    #[test]
    fn test_latest_skips_history() {
        tokio_test::block_on(async {
            let broker = InMemoryBroker::with_offset_reset(OffsetReset::Latest);
            broker.send(TOPIC, b"old".to_vec()).await.unwrap();

            let mut sub = broker.subscribe(TOPIC, "fresh").await.unwrap();
            assert_eq!(sub.poll(Duration::from_millis(10)).await.unwrap(), None);

            broker.send(TOPIC, b"new".to_vec()).await.unwrap();
            assert_eq!(
                sub.poll(Duration::from_millis(10)).await.unwrap().as_deref(),
                Some("new")
            );
        });
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let broker = InMemoryBroker::new();
        let mut sub = broker.subscribe(TOPIC, "g").await.unwrap();

        let sender = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.send(TOPIC, b"late".to_vec()).await.unwrap();
        });

        let started = std::time::Instant::now();
        let got = sub.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(got.as_deref(), Some("late"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_drop_releases_once() {
        tokio_test::block_on(async {
            let broker = InMemoryBroker::new();
            let sub = broker.subscribe(TOPIC, "g").await.unwrap();
            let other = broker.subscribe(TOPIC, "g").await.unwrap();
            assert_eq!(broker.open_subscriptions(), 2);

            sub.close().await;
            assert_eq!(broker.open_subscriptions(), 1);
            drop(other);
            assert_eq!(broker.open_subscriptions(), 0);
        });
    }

    #[test]
    fn test_fault_injection() {
        tokio_test::block_on(async {
            let broker = InMemoryBroker::new();
            let mut sub = broker.subscribe(TOPIC, "g").await.unwrap();

            broker.fail_next_poll("boom");
            assert_eq!(
                sub.poll(Duration::ZERO).await,
                Err(ConsumeTransportError::Connection("boom".to_string()))
            );
            assert_eq!(sub.poll(Duration::ZERO).await, Ok(None));

            broker.set_unavailable(true);
            assert!(broker.send(TOPIC, b"x".to_vec()).await.is_err());
            assert!(broker.subscribe(TOPIC, "g").await.is_err());
        });
    }

    #[test]
    fn test_invalid_utf8_is_decode_error() {
        tokio_test::block_on(async {
            let broker = InMemoryBroker::new();
            broker.append_raw(TOPIC, vec![0xff, 0xfe]);

            let mut sub = broker.subscribe(TOPIC, "g").await.unwrap();
            assert!(matches!(
                sub.poll(Duration::ZERO).await,
                Err(ConsumeTransportError::Decode(_))
            ));
        });
    }
}
