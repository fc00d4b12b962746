//! An open canvas: one relay subscription feeding the action log and the
//! presence channel.

use crate::config::SyncConfig;
use crate::event::{Event, kinds};
use crate::presence::PresenceChannel;
use crate::relay::{RelayEvent, RelayPool, SubscriptionHandle};
use crate::sync::{ActionLog, ApplyOutcome, SyncError, action_filter, cursor_filter};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How many event ids are remembered for de-duplication.
pub const SEEN_CAPACITY: usize = 4096;

/// Bounded set of recently seen event ids.
#[derive(Debug)]
pub struct SeenSet {
    order: VecDeque<String>,
    ids: HashSet<String>,
    capacity: usize,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns true if the id was not seen before.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Routes inbound envelopes of one canvas by kind.
struct Dispatcher {
    actions: Arc<ActionLog>,
    presence: Arc<PresenceChannel>,
    seen: SeenSet,
}

impl Dispatcher {
    fn dispatch(&mut self, relay: &str, event: &Event) {
        if let Err(e) = event.verify() {
            log::debug!("Dropping unverifiable event {} from {}: {}", event.id, relay, e);
            return;
        }
        if !self.seen.insert(&event.id) {
            return;
        }
        match event.kind {
            kinds::CANVAS_ACTION => {
                if let ApplyOutcome::Applied(action) = self.actions.apply_event(event) {
                    log::debug!("Applied remote {} from {}", action.as_str(), relay);
                }
            }
            kinds::CURSOR_POSITION => {
                self.presence.apply_event(event);
            }
            other => log::debug!("Ignoring kind {} from {}", other, relay),
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<RelayEvent>) {
        while let Some(RelayEvent { relay, event }) = events.recv().await {
            self.dispatch(&relay, &event);
        }
    }
}

/// Live sync for one canvas.
///
/// Closing stops the relay listeners and the dispatch task. `close` is
/// idempotent and runs on drop.
pub struct CanvasSession {
    canvas_id: String,
    actions: Arc<ActionLog>,
    presence: Arc<PresenceChannel>,
    handle: SubscriptionHandle,
    pump: Option<JoinHandle<()>>,
}

impl CanvasSession {
    /// Subscribe to the canvas's actions and cursors on every relay.
    pub async fn open(
        canvas_id: impl Into<String>,
        pool: &RelayPool,
        actions: Arc<ActionLog>,
        presence: Arc<PresenceChannel>,
        config: &SyncConfig,
    ) -> Result<Self, SyncError> {
        let canvas_id = canvas_id.into();
        let filters = vec![
            action_filter(&canvas_id),
            cursor_filter(&canvas_id, config.presence_lookback_secs),
        ];
        let subscription = pool.subscribe(filters).await?;
        log::info!("Opened canvas {} on {} relays", canvas_id, subscription.relay_count());

        let (events, handle) = subscription.into_parts();
        let dispatcher = Dispatcher {
            actions: actions.clone(),
            presence: presence.clone(),
            seen: SeenSet::new(SEEN_CAPACITY),
        };
        let pump = tokio::spawn(dispatcher.run(events));

        Ok(Self {
            canvas_id,
            actions,
            presence,
            handle,
            pump: Some(pump),
        })
    }

    pub fn canvas_id(&self) -> &str {
        &self.canvas_id
    }

    pub fn actions(&self) -> &Arc<ActionLog> {
        &self.actions
    }

    pub fn presence(&self) -> &Arc<PresenceChannel> {
        &self.presence
    }

    pub fn is_closed(&self) -> bool {
        self.pump.is_none()
    }

    /// Tear down every listener for this canvas.
    pub fn close(&mut self) {
        self.handle.close();
        if let Some(pump) = self.pump.take() {
            pump.abort();
            log::info!("Closed canvas {}", self.canvas_id);
        }
    }
}

impl Drop for CanvasSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elements::CanvasElement;
    use crate::event::UnsignedEvent;
    use crate::identity::Keys;
    use crate::relay::{MemoryRelay, Relay};
    use crate::store::ElementStore;
    use crate::sync::Action;
    use std::time::Duration;

    #[test]
    fn test_seen_set_evicts_oldest() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert_eq!(seen.len(), 2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }

    fn parts(keys: &Keys, relay: &MemoryRelay) -> (RelayPool, Arc<ActionLog>, Arc<PresenceChannel>) {
        let pool = RelayPool::new(vec![Arc::new(relay.clone()) as Arc<dyn Relay>]);
        let actions = Arc::new(ActionLog::new(pool.clone(), Arc::new(keys.clone()), ElementStore::new().shared()));
        let presence = Arc::new(PresenceChannel::new(
            pool.clone(),
            Arc::new(keys.clone()),
            Duration::from_millis(100),
        ));
        (pool, actions, presence)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_session_routes_by_kind() {
        let relay = MemoryRelay::new("mem://a");
        let me = Keys::generate();
        let peer = Keys::generate();
        let (pool, actions, presence) = parts(&me, &relay);
        let mut session = CanvasSession::open("c1", &pool, actions.clone(), presence.clone(), &SyncConfig::default())
            .await
            .unwrap();

        let (_, peer_actions, peer_presence) = parts(&peer, &relay);
        let rect = CanvasElement::rectangle(0.0, 0.0, 5.0, 5.0, peer.public_key_hex());
        peer_actions.publish(Action::Add, &rect, "c1").await.unwrap();
        peer_actions.publish(Action::Add, &rect, "other").await.unwrap();
        assert!(peer_presence.broadcast_position(3.0, 4.0, "c1").await);
        settle().await;

        assert_eq!(actions.store().lock().get(&rect.id), Some(&rect));
        assert_eq!(actions.store().lock().len(), 1);
        assert!(presence.book().lock().unwrap().get(&peer.public_key_hex()).is_some());

        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(relay.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_session_applies_nothing() {
        let relay = MemoryRelay::new("mem://a");
        let me = Keys::generate();
        let peer = Keys::generate();
        let (pool, actions, presence) = parts(&me, &relay);
        drop(
            CanvasSession::open("c1", &pool, actions.clone(), presence, &SyncConfig::default())
                .await
                .unwrap(),
        );
        assert_eq!(relay.listener_count(), 0);

        let late = UnsignedEvent::new(kinds::CANVAS_ACTION, "{}").tag("canvas", "c1").sign(&peer);
        relay.publish(&late).await.unwrap();
        settle().await;
        assert!(actions.store().lock().is_empty());
    }
}
