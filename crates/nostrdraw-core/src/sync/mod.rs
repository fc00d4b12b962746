//! Action-log sync.
//!
//! Local edits go out as signed action envelopes to every relay. Envelopes
//! from other identities are replayed into the element store in arrival
//! order, so the last update applied wins at each observer.

mod envelope;

pub use envelope::{Action, ActionEnvelope, RemoteAction, decode};

use crate::clock::{now_millis, now_secs};
use crate::elements::{CanvasElement, ElementPatch};
use crate::event::{Event, Filter, UnsignedEvent, kinds};
use crate::relay::{PublishReport, RelayError, RelayPool};
use crate::signer::{SharedSigner, SignerError};
use crate::store::SharedStore;
use thiserror::Error;

/// Sync errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Signing failed: {0}")]
    Signer(#[from] SignerError),
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("No relay accepted the envelope")]
    Undelivered,
    #[error("Malformed action: {0}")]
    Malformed(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Filter for the action envelopes of one canvas.
pub fn action_filter(canvas_id: &str) -> Filter {
    Filter::new().kind(kinds::CANVAS_ACTION).tag("canvas", [canvas_id])
}

/// Filter for recent cursor envelopes of one canvas.
pub fn cursor_filter(canvas_id: &str, lookback_secs: u64) -> Filter {
    Filter::new()
        .kind(kinds::CURSOR_POSITION)
        .tag("canvas", [canvas_id])
        .since(now_secs().saturating_sub(lookback_secs))
}

/// What happened to an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The store changed.
    Applied(Action),
    /// Valid, but nothing to do (unknown id, already deleted).
    NoOp(Action),
    /// Authored by the local identity.
    SelfEcho,
    /// Not an action envelope, or content failed to decode.
    Dropped,
}

/// Publishes local edits and replays remote ones.
pub struct ActionLog {
    pool: RelayPool,
    signer: SharedSigner,
    store: SharedStore,
}

impl ActionLog {
    pub fn new(pool: RelayPool, signer: SharedSigner, store: SharedStore) -> Self {
        Self { pool, signer, store }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Hex public key actions are signed with.
    pub fn author(&self) -> String {
        self.signer.public_key()
    }

    /// Sign and broadcast one action to every relay, once each.
    ///
    /// Succeeds if at least one relay accepted the envelope.
    pub async fn publish(
        &self,
        action: Action,
        element: &CanvasElement,
        canvas_id: &str,
    ) -> Result<PublishReport, SyncError> {
        let content = serde_json::to_string(&ActionEnvelope {
            action,
            element,
            timestamp: now_millis(),
        })
        .map_err(|e| SyncError::Serialization(e.to_string()))?;

        let author = self.signer.public_key();
        let unsigned = UnsignedEvent::new(kinds::CANVAS_ACTION, content)
            .tag("d", canvas_id)
            .tag("canvas", canvas_id)
            .tag("author", author);
        let event = self.signer.sign(unsigned).await?;

        let report = self.pool.publish(&event).await;
        if !report.is_success() {
            log::warn!("{} of {} reached no relay", action.as_str(), element.id);
            return Err(SyncError::Undelivered);
        }
        Ok(report)
    }

    /// Replay a received envelope into the store.
    pub fn apply_event(&self, event: &Event) -> ApplyOutcome {
        if event.kind != kinds::CANVAS_ACTION {
            return ApplyOutcome::Dropped;
        }
        if event.pubkey == self.signer.public_key() {
            return ApplyOutcome::SelfEcho;
        }
        let remote = match decode(&event.content) {
            Ok((remote, _timestamp)) => remote,
            Err(e) => {
                log::debug!("Dropping action {}: {}", event.id, e);
                return ApplyOutcome::Dropped;
            }
        };
        self.apply(remote)
    }

    /// Apply a decoded action through the store's public operations.
    pub fn apply(&self, remote: RemoteAction) -> ApplyOutcome {
        let action = remote.action();
        let changed = self.store.with(|store| match remote {
            RemoteAction::Add(element) => {
                store.add(element);
                true
            }
            RemoteAction::Update(element) => {
                let id = element.id.clone();
                store.update(&id, ElementPatch::from(element))
            }
            RemoteAction::Delete(id) => store.soft_delete(&id),
        });
        if changed {
            ApplyOutcome::Applied(action)
        } else {
            ApplyOutcome::NoOp(action)
        }
    }
}
