//! Presence: collaborator cursors and short-lived overlay strokes.
//!
//! Nothing here is persisted. Cursor records go stale after a freshness
//! window; overlay elements carry their own expiry and are purged by a sweep
//! that does not depend on relay traffic.

use crate::clock::now_millis;
use crate::elements::CanvasElement;
use crate::event::{Event, UnsignedEvent, kinds};
use crate::relay::RelayPool;
use crate::signer::SharedSigner;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Cursor colors, picked per collaborator.
pub const CURSOR_PALETTE: [&str; 6] = ["#f59e0b", "#8b5cf6", "#ec4899", "#06b6d4", "#10b981", "#f97316"];

/// Deterministic palette color for a public key.
pub fn color_for(pubkey: &str) -> &'static str {
    let index = pubkey
        .get(pubkey.len().saturating_sub(2)..)
        .and_then(|tail| u8::from_str_radix(tail, 16).ok())
        .map(|n| n as usize % CURSOR_PALETTE.len())
        .unwrap_or(0);
    CURSOR_PALETTE[index]
}

/// Content of a cursor-position envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPayload {
    pub x: f64,
    pub y: f64,
    pub canvas_id: String,
    pub timestamp: i64,
}

/// Last known cursor of one collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub pubkey: String,
    pub x: f64,
    pub y: f64,
    pub color: &'static str,
    pub name: Option<String>,
    /// Local receive time in milliseconds. The sender's clock is not
    /// trusted, so freshness is judged against our own.
    pub timestamp: i64,
}

impl PresenceRecord {
    /// A record is fresh while strictly younger than `window`.
    pub fn is_fresh(&self, now: i64, window: Duration) -> bool {
        now - self.timestamp < window.as_millis() as i64
    }
}

/// Presence records keyed by collaborator.
#[derive(Debug, Default)]
pub struct PresenceBook {
    records: HashMap<String, PresenceRecord>,
}

impl PresenceBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cursor position, keeping any known display name.
    pub fn update(&mut self, pubkey: &str, x: f64, y: f64, now: i64) {
        let record = self
            .records
            .entry(pubkey.to_string())
            .or_insert_with(|| PresenceRecord {
                pubkey: pubkey.to_string(),
                x,
                y,
                color: color_for(pubkey),
                name: None,
                timestamp: now,
            });
        record.x = x;
        record.y = y;
        record.timestamp = now;
    }

    pub fn set_name(&mut self, pubkey: &str, name: impl Into<String>) {
        if let Some(record) = self.records.get_mut(pubkey) {
            record.name = Some(name.into());
        }
    }

    pub fn get(&self, pubkey: &str) -> Option<&PresenceRecord> {
        self.records.get(pubkey)
    }

    /// Cursors worth drawing.
    pub fn fresh_cursors(&self, now: i64, window: Duration) -> Vec<&PresenceRecord> {
        let mut fresh: Vec<&PresenceRecord> = self.records.values().filter(|r| r.is_fresh(now, window)).collect();
        fresh.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
        fresh
    }

    /// Fresh collaborators plus the local user.
    pub fn online_count(&self, now: i64, window: Duration) -> usize {
        self.records.values().filter(|r| r.is_fresh(now, window)).count() + 1
    }

    /// Drop records that went stale.
    pub fn prune(&mut self, now: i64, window: Duration) {
        self.records.retain(|_, r| r.is_fresh(now, window));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Shared handle to a presence book.
pub type SharedPresence = Arc<Mutex<PresenceBook>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Rate limiter for outgoing cursor broadcasts.
#[derive(Debug, Clone)]
pub struct CursorThrottle {
    interval_ms: i64,
    last_sent: Option<i64>,
}

impl CursorThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as i64,
            last_sent: None,
        }
    }

    /// Returns true and starts a new interval when a send is allowed at `now`.
    pub fn allow(&mut self, now: i64) -> bool {
        match self.last_sent {
            Some(last) if now - last < self.interval_ms => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }
}

/// Broadcasts the local cursor and records everyone else's.
pub struct PresenceChannel {
    pool: RelayPool,
    signer: SharedSigner,
    book: SharedPresence,
    throttle: Mutex<CursorThrottle>,
}

impl PresenceChannel {
    pub fn new(pool: RelayPool, signer: SharedSigner, interval: Duration) -> Self {
        Self {
            pool,
            signer,
            book: Arc::new(Mutex::new(PresenceBook::new())),
            throttle: Mutex::new(CursorThrottle::new(interval)),
        }
    }

    pub fn book(&self) -> SharedPresence {
        self.book.clone()
    }

    /// Send the local cursor position, at most once per interval.
    ///
    /// Returns whether anything was sent. Failures are logged and dropped.
    pub async fn broadcast_position(&self, x: f64, y: f64, canvas_id: &str) -> bool {
        let now = now_millis();
        if !lock(&self.throttle).allow(now) {
            return false;
        }

        let payload = CursorPayload {
            x,
            y,
            canvas_id: canvas_id.to_string(),
            timestamp: now,
        };
        let content = match serde_json::to_string(&payload) {
            Ok(content) => content,
            Err(e) => {
                log::debug!("Cursor payload not serializable: {}", e);
                return false;
            }
        };
        let unsigned = UnsignedEvent::new(kinds::CURSOR_POSITION, content)
            .tag("canvas", canvas_id)
            .tag("author", self.signer.public_key());

        let event = match self.signer.sign(unsigned).await {
            Ok(event) => event,
            Err(e) => {
                log::debug!("Cursor not signed: {}", e);
                return false;
            }
        };
        let report = self.pool.publish(&event).await;
        if !report.is_success() {
            log::debug!("Cursor broadcast reached no relay");
        }
        report.is_success()
    }

    /// Record a received cursor envelope. Returns true if the book changed.
    pub fn apply_event(&self, event: &Event) -> bool {
        self.apply_event_at(event, now_millis())
    }

    pub fn apply_event_at(&self, event: &Event, now: i64) -> bool {
        if event.kind != kinds::CURSOR_POSITION || event.pubkey == self.signer.public_key() {
            return false;
        }
        match serde_json::from_str::<CursorPayload>(&event.content) {
            Ok(cursor) => {
                lock(&self.book).update(&event.pubkey, cursor.x, cursor.y, now);
                true
            }
            Err(e) => {
                log::debug!("Dropping cursor {}: {}", event.id, e);
                false
            }
        }
    }
}

/// A transient element with an absolute expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayElement {
    pub element: CanvasElement,
    /// Expiry in milliseconds since the epoch.
    pub expires_at: i64,
}

/// Transient strokes such as a laser pointer.
#[derive(Debug, Clone, Default)]
pub struct OverlayLayer {
    items: Arc<Mutex<Vec<OverlayElement>>>,
}

impl OverlayLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element expiring `ttl` after `now`. Returns the expiry.
    pub fn add(&self, element: CanvasElement, now: i64, ttl: Duration) -> i64 {
        let expires_at = now + ttl.as_millis() as i64;
        lock(&self.items).push(OverlayElement { element, expires_at });
        expires_at
    }

    /// Remove expired elements. Returns how many were removed.
    pub fn sweep(&self, now: i64) -> usize {
        let mut items = lock(&self.items);
        let before = items.len();
        items.retain(|item| item.expires_at > now);
        before - items.len()
    }

    /// Live elements.
    pub fn elements(&self) -> Vec<CanvasElement> {
        lock(&self.items).iter().map(|item| item.element.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    /// Sweep on a fixed interval until the handle is stopped or dropped.
    pub fn spawn_sweeper(&self, every: Duration) -> SweeperHandle {
        let layer = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = layer.sweep(now_millis());
                if removed > 0 {
                    log::trace!("Swept {} overlay elements", removed);
                }
            }
        });
        SweeperHandle { task: Some(task) }
    }
}

/// Stops an overlay sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
