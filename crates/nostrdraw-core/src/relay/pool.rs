//! Fan-out over a fixed relay list.

use super::{Relay, RelayError, RelayEvent, RelayListener, RelayResult, WebSocketRelay};
use crate::config::SyncConfig;
use crate::event::{Event, Filter};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Per-relay outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,
    /// Relays that acknowledged the envelope.
    pub accepted: Vec<String>,
    /// Relays that failed, with the reason.
    pub failed: Vec<(String, RelayError)>,
}

impl PublishReport {
    /// A publish succeeds if at least one relay accepted it.
    pub fn is_success(&self) -> bool {
        !self.accepted.is_empty()
    }
}

/// A subscription spanning every relay that accepted it.
#[derive(Debug)]
pub struct PoolSubscription {
    events: mpsc::UnboundedReceiver<RelayEvent>,
    handle: SubscriptionHandle,
}

impl PoolSubscription {
    /// Next envelope from any relay. `None` once every listener is closed.
    pub async fn recv(&mut self) -> Option<RelayEvent> {
        self.events.recv().await
    }

    /// Close every relay listener. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.handle.close();
    }

    /// Number of relays carrying this subscription.
    pub fn relay_count(&self) -> usize {
        self.handle.listeners.len()
    }

    /// Separate the receiving end from the teardown handle.
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<RelayEvent>, SubscriptionHandle) {
        (self.events, self.handle)
    }
}

/// Teardown handle for a [`PoolSubscription`].
#[derive(Debug, Default)]
pub struct SubscriptionHandle {
    listeners: Vec<RelayListener>,
}

impl SubscriptionHandle {
    /// Close every relay listener. Safe to call repeatedly.
    pub fn close(&mut self) {
        for listener in &mut self.listeners {
            listener.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.listeners.iter().all(RelayListener::is_closed)
    }
}

/// The configured relays, operated as one.
///
/// A slow or failing relay never blocks the others: every operation runs on
/// all relays concurrently, each under its own timeout.
#[derive(Clone)]
pub struct RelayPool {
    relays: Vec<Arc<dyn Relay>>,
    publish_timeout: Duration,
    query_timeout: Duration,
}

impl RelayPool {
    pub fn new(relays: Vec<Arc<dyn Relay>>) -> Self {
        Self {
            relays,
            publish_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(10),
        }
    }

    /// WebSocket relays for every configured URL.
    pub fn from_config(config: &SyncConfig) -> Self {
        let relays = config
            .relays
            .iter()
            .map(|url| {
                let relay = WebSocketRelay::new(url.as_str()).with_timeouts(config.publish_timeout(), config.query_timeout());
                Arc::new(relay) as Arc<dyn Relay>
            })
            .collect();
        Self::new(relays).with_timeouts(config.publish_timeout(), config.query_timeout())
    }

    pub fn with_timeouts(mut self, publish: Duration, query: Duration) -> Self {
        self.publish_timeout = publish;
        self.query_timeout = query;
        self
    }

    pub fn relay_urls(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Send an envelope to every relay, once each.
    pub async fn publish(&self, event: &Event) -> PublishReport {
        let attempts = self.relays.iter().map(|relay| async move {
            let result = timeout(self.publish_timeout, relay.publish(event))
                .await
                .unwrap_or(Err(RelayError::Timeout));
            (relay.url().to_string(), result)
        });

        let mut report = PublishReport {
            event_id: event.id.clone(),
            ..Default::default()
        };
        for (url, result) in join_all(attempts).await {
            match result {
                Ok(()) => report.accepted.push(url),
                Err(e) => {
                    log::warn!("Publish of {} to {} failed: {}", event.id, url, e);
                    report.failed.push((url, e));
                }
            }
        }
        log::debug!(
            "Published {} (kind {}) to {}/{} relays",
            event.id,
            event.kind,
            report.accepted.len(),
            self.relays.len()
        );
        report
    }

    /// Stored envelopes from every relay, merged by id, newest first.
    ///
    /// Fails only when no relay answered.
    pub async fn query(&self, filters: Vec<Filter>) -> RelayResult<Vec<Event>> {
        let attempts = self.relays.iter().map(|relay| {
            let filters = filters.clone();
            async move {
                let result = timeout(self.query_timeout, relay.query(filters))
                    .await
                    .unwrap_or(Err(RelayError::Timeout));
                (relay.url().to_string(), result)
            }
        });

        let mut merged: HashMap<String, Event> = HashMap::new();
        let mut errors = Vec::new();
        let mut answered = false;
        for (url, result) in join_all(attempts).await {
            match result {
                Ok(events) => {
                    answered = true;
                    for event in events {
                        merged.entry(event.id.clone()).or_insert(event);
                    }
                }
                Err(e) => {
                    log::warn!("Query on {} failed: {}", url, e);
                    errors.push(format!("{}: {}", url, e));
                }
            }
        }

        if !answered {
            return Err(RelayError::Unavailable(if errors.is_empty() {
                "no relays configured".to_string()
            } else {
                errors.join("; ")
            }));
        }

        let mut events: Vec<Event> = merged.into_values().collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }

    /// Listen on every relay. Succeeds if at least one relay accepted.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> RelayResult<PoolSubscription> {
        let (sink, events) = mpsc::unbounded_channel();
        let attempts = self.relays.iter().map(|relay| {
            let filters = filters.clone();
            let sink = sink.clone();
            async move {
                let result = timeout(self.query_timeout, relay.subscribe(filters, sink))
                    .await
                    .unwrap_or(Err(RelayError::Timeout));
                (relay.url().to_string(), result)
            }
        });
        let results = join_all(attempts).await;
        drop(sink);

        let mut listeners = Vec::new();
        let mut errors = Vec::new();
        for (url, result) in results {
            match result {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    log::warn!("Subscribe on {} failed: {}", url, e);
                    errors.push(format!("{}: {}", url, e));
                }
            }
        }

        if listeners.is_empty() {
            return Err(RelayError::Unavailable(if errors.is_empty() {
                "no relays configured".to_string()
            } else {
                errors.join("; ")
            }));
        }

        Ok(PoolSubscription {
            events,
            handle: SubscriptionHandle { listeners },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UnsignedEvent;
    use crate::identity::Keys;
    use crate::relay::MemoryRelay;

    fn pool_of(relays: &[MemoryRelay]) -> RelayPool {
        RelayPool::new(relays.iter().map(|r| Arc::new(r.clone()) as Arc<dyn Relay>).collect())
    }

    #[tokio::test]
    async fn test_publish_survives_offline_relay() {
        let up = MemoryRelay::new("mem://up");
        let down = MemoryRelay::new("mem://down");
        down.set_online(false);
        let pool = pool_of(&[up.clone(), down]);

        let event = UnsignedEvent::new(1, "hello").sign(&Keys::generate());
        let report = pool.publish(&event).await;

        assert!(report.is_success());
        assert_eq!(report.accepted, vec!["mem://up".to_string()]);
        assert_eq!(report.failed, vec![("mem://down".to_string(), RelayError::Offline)]);
        assert_eq!(up.stored().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_fails_when_all_relays_fail() {
        let down = MemoryRelay::new("mem://down");
        down.set_online(false);
        let pool = pool_of(&[down]);

        let event = UnsignedEvent::new(1, "hello").sign(&Keys::generate());
        assert!(!pool.publish(&event).await.is_success());
    }

    #[tokio::test]
    async fn test_query_merges_duplicates() {
        let a = MemoryRelay::new("mem://a");
        let b = MemoryRelay::new("mem://b");
        let pool = pool_of(&[a.clone(), b.clone()]);
        let keys = Keys::generate();

        let shared = UnsignedEvent::new(1, "both").created_at(10).sign(&keys);
        let only_b = UnsignedEvent::new(1, "b").created_at(20).sign(&keys);
        pool.publish(&shared).await;
        b.publish(&only_b).await.unwrap();

        let events = pool.query(vec![Filter::new().kind(1)]).await.unwrap();
        assert_eq!(events, vec![only_b, shared]);
    }

    #[tokio::test]
    async fn test_query_needs_one_relay() {
        let down = MemoryRelay::new("mem://down");
        down.set_online(false);
        let pool = pool_of(&[down]);
        assert!(matches!(pool.query(vec![Filter::new()]).await, Err(RelayError::Unavailable(_))));

        let empty = RelayPool::new(Vec::new());
        assert!(matches!(empty.query(vec![Filter::new()]).await, Err(RelayError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_subscription_close_is_idempotent() {
        let a = MemoryRelay::new("mem://a");
        let b = MemoryRelay::new("mem://b");
        let pool = pool_of(&[a.clone(), b.clone()]);

        let mut sub = pool.subscribe(vec![Filter::new().kind(1)]).await.unwrap();
        assert_eq!(sub.relay_count(), 2);

        let event = UnsignedEvent::new(1, "x").sign(&Keys::generate());
        a.publish(&event).await.unwrap();
        b.publish(&event).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().event, event);
        assert_eq!(sub.recv().await.unwrap().event, event);

        sub.close();
        sub.close();
        assert_eq!(a.listener_count() + b.listener_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_fails_without_relays() {
        let down = MemoryRelay::new("mem://down");
        down.set_online(false);
        assert!(pool_of(&[down]).subscribe(vec![Filter::new()]).await.is_err());
    }
}
