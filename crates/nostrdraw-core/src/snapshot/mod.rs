//! Canvas checkpoints.
//!
//! A checkpoint is the full set of non-deleted elements of one canvas,
//! published as a replaceable envelope keyed by the canvas id. Each save
//! replaces the previous checkpoint of the same (canvas, author) pair.

mod autosave;

pub use autosave::{AutoSaveManager, DEFAULT_AUTOSAVE_INTERVAL_SECS};

use crate::clock::now_millis;
use crate::elements::CanvasElement;
use crate::event::{Event, Filter, UnsignedEvent, kinds};
use crate::identity::{IdentityError, parse_public_key};
use crate::relay::{PublishReport, RelayError, RelayPool};
use crate::signer::{SharedSigner, SignerError};
use crate::store::SharedStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Schema version written into every checkpoint.
pub const CHECKPOINT_VERSION: &str = "1.0";

/// Value of the `client` tag.
pub const CLIENT_NAME: &str = "NostrDraw";

/// Snapshot errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("Save failed: {0}")]
    Signer(#[from] SignerError),
    #[error("Load failed: {0}")]
    Relay(#[from] RelayError),
    #[error("Save failed: no relay accepted the checkpoint")]
    Undelivered,
    #[error("Invalid author: {0}")]
    InvalidAuthor(#[from] IdentityError),
    #[error("Malformed checkpoint: {0}")]
    Malformed(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Full state of one canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasCheckpoint {
    pub version: String,
    pub canvas_id: String,
    pub canvas_name: String,
    pub elements: Vec<CanvasElement>,
    /// Save time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Hex public key of the author, taken from the envelope.
    #[serde(skip)]
    pub author: String,
}

impl CanvasCheckpoint {
    /// Decode a checkpoint envelope.
    pub fn from_event(event: &Event) -> Result<Self, SnapshotError> {
        if event.kind != kinds::CANVAS_CHECKPOINT {
            return Err(SnapshotError::Malformed(format!("unexpected kind {}", event.kind)));
        }
        let mut checkpoint: CanvasCheckpoint =
            serde_json::from_str(&event.content).map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        if checkpoint.canvas_id.is_empty() {
            checkpoint.canvas_id = event.identifier().to_string();
        }
        checkpoint.author = event.pubkey.clone();
        Ok(checkpoint)
    }

    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            canvas_id: self.canvas_id.clone(),
            canvas_name: self.canvas_name.clone(),
            timestamp: self.timestamp,
            element_count: self.elements.len(),
        }
    }
}

/// Catalog entry for one saved canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSummary {
    pub canvas_id: String,
    pub canvas_name: String,
    pub timestamp: i64,
    pub element_count: usize,
}

/// Hex form of an author given as hex or `npub1…`.
fn normalize_author(author: &str) -> Result<String, SnapshotError> {
    Ok(parse_public_key(author)?.to_string())
}

/// Saves, loads and lists checkpoints.
pub struct SnapshotService {
    pool: RelayPool,
    signer: SharedSigner,
    store: SharedStore,
}

impl SnapshotService {
    pub fn new(pool: RelayPool, signer: SharedSigner, store: SharedStore) -> Self {
        Self { pool, signer, store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Publish the store's non-deleted elements as the checkpoint of `canvas_id`.
    pub async fn save(&self, canvas_id: &str, canvas_name: &str) -> Result<PublishReport, SnapshotError> {
        let elements = self.store.lock().visible_elements();
        let checkpoint = CanvasCheckpoint {
            version: CHECKPOINT_VERSION.to_string(),
            canvas_id: canvas_id.to_string(),
            canvas_name: canvas_name.to_string(),
            elements,
            timestamp: now_millis(),
            author: String::new(),
        };
        let content = serde_json::to_string(&checkpoint).map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let unsigned = UnsignedEvent::new(kinds::CANVAS_CHECKPOINT, content)
            .tag("d", canvas_id)
            .tag("title", canvas_name)
            .tag("client", CLIENT_NAME);
        let event = self.signer.sign(unsigned).await?;

        let report = self.pool.publish(&event).await;
        if !report.is_success() {
            log::warn!("Checkpoint of {} reached no relay", canvas_id);
            return Err(SnapshotError::Undelivered);
        }
        log::info!(
            "Saved {} ({} elements) to {} relays",
            canvas_id,
            checkpoint.elements.len(),
            report.accepted.len()
        );
        Ok(report)
    }

    /// Latest checkpoint of `canvas_id` by `author`, or by the local identity.
    pub async fn load(&self, canvas_id: &str, author: Option<&str>) -> Result<Option<CanvasCheckpoint>, SnapshotError> {
        let author = match author {
            Some(author) => normalize_author(author)?,
            None => self.signer.public_key(),
        };
        let filter = Filter::new()
            .kind(kinds::CANVAS_CHECKPOINT)
            .tag("d", [canvas_id])
            .authors([author.as_str()])
            .limit(1);

        let events = self.pool.query(vec![filter]).await?;
        let newest = events
            .iter()
            .filter(|e| e.kind == kinds::CANVAS_CHECKPOINT && e.pubkey == author && e.identifier() == canvas_id)
            .filter(|e| e.verify().is_ok())
            .reduce(|best, e| if e.supersedes(best) { e } else { best });

        match newest {
            Some(event) => CanvasCheckpoint::from_event(event).map(Some),
            None => {
                log::debug!("No checkpoint for {} by {}", canvas_id, author);
                Ok(None)
            }
        }
    }

    /// Every canvas saved by `identity`, newest first.
    pub async fn list_for_identity(&self, identity: &str) -> Result<Vec<CheckpointSummary>, SnapshotError> {
        let author = normalize_author(identity)?;
        let filter = Filter::new()
            .kind(kinds::CANVAS_CHECKPOINT)
            .authors([author.as_str()]);
        let events = self.pool.query(vec![filter]).await?;

        let mut newest: HashMap<String, &Event> = HashMap::new();
        for event in events.iter().filter(|e| e.pubkey == author && e.verify().is_ok()) {
            let slot = newest.entry(event.identifier().to_string()).or_insert(event);
            if event.supersedes(slot) {
                *slot = event;
            }
        }

        let mut summaries: Vec<CheckpointSummary> = newest
            .into_values()
            .filter_map(|event| match CanvasCheckpoint::from_event(event) {
                Ok(checkpoint) => Some(checkpoint.summary()),
                Err(e) => {
                    log::debug!("Skipping {}: {}", event.id, e);
                    None
                }
            })
            .collect();
        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.canvas_id.cmp(&b.canvas_id)));
        Ok(summaries)
    }

    /// Replace the store's contents with a checkpoint's elements.
    ///
    /// Returns the number of elements loaded.
    pub fn restore(&self, checkpoint: &CanvasCheckpoint) -> usize {
        self.store.with(|store| {
            store.load_bulk(checkpoint.elements.iter().cloned());
            store.len()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;
    use crate::relay::{MemoryRelay, Relay};
    use crate::store::ElementStore;
    use std::sync::Arc;

    fn service(keys: &Keys, relay: &MemoryRelay) -> SnapshotService {
        let pool = RelayPool::new(vec![Arc::new(relay.clone()) as Arc<dyn Relay>]);
        SnapshotService::new(pool, Arc::new(keys.clone()), ElementStore::new().shared())
    }

    #[tokio::test]
    async fn test_save_skips_tombstones() {
        let relay = MemoryRelay::new("mem://a");
        let keys = Keys::generate();
        let snapshots = service(&keys, &relay);
        let keep = CanvasElement::rectangle(0.0, 0.0, 10.0, 10.0, keys.public_key_hex());
        let gone = CanvasElement::ellipse(5.0, 5.0, 10.0, 10.0, keys.public_key_hex());
        snapshots.store().with(|store| {
            store.add(keep.clone());
            store.add(gone.clone());
            store.soft_delete(&gone.id);
        });

        snapshots.save("c1", "Sketch").await.unwrap();

        let stored = relay.stored();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].tag_value("title"), Some("Sketch"));
        assert_eq!(stored[0].tag_value("client"), Some(CLIENT_NAME));

        let checkpoint = snapshots.load("c1", None).await.unwrap().unwrap();
        assert_eq!(checkpoint.version, CHECKPOINT_VERSION);
        assert_eq!(checkpoint.elements, vec![keep]);
        assert_eq!(checkpoint.author, keys.public_key_hex());
    }

    #[tokio::test]
    async fn test_save_replaces_previous_checkpoint() {
        let relay = MemoryRelay::new("mem://a");
        let keys = Keys::generate();
        let snapshots = service(&keys, &relay);

        snapshots.save("c1", "First").await.unwrap();
        snapshots
            .store()
            .with(|store| store.add(CanvasElement::rectangle(0.0, 0.0, 1.0, 1.0, "x")));
        // Envelope timestamps have second resolution.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        snapshots.save("c1", "Second").await.unwrap();

        assert_eq!(relay.stored().len(), 1);
        let checkpoint = snapshots.load("c1", None).await.unwrap().unwrap();
        assert_eq!(checkpoint.canvas_name, "Second");
        assert_eq!(checkpoint.elements.len(), 1);
    }

    #[tokio::test]
    async fn test_load_by_other_author() {
        let relay = MemoryRelay::new("mem://a");
        let alice = Keys::generate();
        let bob = Keys::generate();
        service(&alice, &relay).save("c1", "Alice's").await.unwrap();

        let snapshots = service(&bob, &relay);
        assert!(snapshots.load("c1", None).await.unwrap().is_none());

        let by_npub = snapshots.load("c1", Some(&alice.npub())).await.unwrap().unwrap();
        assert_eq!(by_npub.canvas_name, "Alice's");
        assert!(matches!(
            snapshots.load("c1", Some("nobody")).await,
            Err(SnapshotError::InvalidAuthor(_))
        ));
    }

    #[tokio::test]
    async fn test_list_for_identity() {
        let relay = MemoryRelay::new("mem://a");
        let keys = Keys::generate();
        let snapshots = service(&keys, &relay);

        let old = serde_json::json!({
            "version": "1.0", "canvasId": "old", "canvasName": "Old",
            "elements": [], "timestamp": 1_000,
        });
        let new = serde_json::json!({
            "version": "1.0", "canvasId": "new", "canvasName": "New",
            "elements": [CanvasElement::rectangle(0.0, 0.0, 1.0, 1.0, "x")], "timestamp": 2_000,
        });
        for (d, content) in [("old", old), ("new", new)] {
            let event = UnsignedEvent::new(kinds::CANVAS_CHECKPOINT, content.to_string())
                .tag("d", d)
                .sign(&keys);
            relay.publish(&event).await.unwrap();
        }
        // Another app's data under the same kind is skipped.
        let foreign = UnsignedEvent::new(kinds::CANVAS_CHECKPOINT, "{\"theme\":\"dark\"}")
            .tag("d", "settings")
            .sign(&keys);
        relay.publish(&foreign).await.unwrap();

        let listing = snapshots.list_for_identity(&keys.public_key_hex()).await.unwrap();
        assert_eq!(
            listing,
            vec![
                CheckpointSummary {
                    canvas_id: "new".to_string(),
                    canvas_name: "New".to_string(),
                    timestamp: 2_000,
                    element_count: 1,
                },
                CheckpointSummary {
                    canvas_id: "old".to_string(),
                    canvas_name: "Old".to_string(),
                    timestamp: 1_000,
                    element_count: 0,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_load_fails_when_no_relay_answers() {
        let relay = MemoryRelay::new("mem://down");
        relay.set_online(false);
        let snapshots = service(&Keys::generate(), &relay);
        assert!(matches!(snapshots.load("c1", None).await, Err(SnapshotError::Relay(_))));
        assert_eq!(snapshots.save("c1", "x").await, Err(SnapshotError::Undelivered));
    }

    #[test]
    fn test_restore_replaces_store() {
        let relay = MemoryRelay::new("mem://a");
        let snapshots = service(&Keys::generate(), &relay);
        snapshots
            .store()
            .with(|store| store.add(CanvasElement::text(0.0, 0.0, "stale", "x")));

        let fresh = CanvasElement::rectangle(1.0, 1.0, 2.0, 2.0, "x");
        let checkpoint = CanvasCheckpoint {
            version: CHECKPOINT_VERSION.to_string(),
            canvas_id: "c1".to_string(),
            canvas_name: "c1".to_string(),
            elements: vec![fresh.clone()],
            timestamp: 0,
            author: String::new(),
        };
        assert_eq!(snapshots.restore(&checkpoint), 1);
        assert_eq!(snapshots.store().lock().visible_elements(), vec![fresh]);
    }
}
