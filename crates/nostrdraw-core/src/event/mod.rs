//! Signed message envelopes.
//!
//! An envelope's id is the SHA-256 of the canonical JSON array
//! `[0, pubkey, created_at, kind, tags, content]`, and its signature is a
//! BIP-340 Schnorr signature over that id by `pubkey`.

mod filter;

pub use filter::Filter;

use crate::clock::now_secs;
use crate::identity::{Keys, secp};
use secp256k1::schnorr::Signature;
use secp256k1::{Message, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

/// Envelope kinds used by the canvas.
pub mod kinds {
    /// Profile metadata.
    pub const METADATA: u16 = 0;
    /// Add/update/delete of one element.
    pub const CANVAS_ACTION: u16 = 33333;
    /// Cursor position broadcast.
    pub const CURSOR_POSITION: u16 = 25050;
    /// Pairing handshake between a client and a remote signer.
    pub const PAIRING_HANDSHAKE: u16 = 24133;
    /// Full canvas checkpoint, one per canvas and author.
    pub const CANVAS_CHECKPOINT: u16 = 30078;
}

/// A tag: name followed by values.
pub type Tag = Vec<String>;

/// Envelope errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Event id does not match its contents")]
    IdMismatch,
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    #[error("Malformed event: {0}")]
    Malformed(String),
}

/// Kinds whose events relays forward but do not store.
pub fn is_ephemeral(kind: u16) -> bool {
    (20000..30000).contains(&kind)
}

/// Kinds where relays keep only the newest event per author.
pub fn is_replaceable(kind: u16) -> bool {
    kind == 0 || kind == 3 || (10000..20000).contains(&kind)
}

/// Kinds where relays keep only the newest event per author and `d` tag.
pub fn is_addressable(kind: u16) -> bool {
    (30000..40000).contains(&kind)
}

/// Compute an envelope id.
pub fn compute_id(pubkey: &str, created_at: u64, kind: u16, tags: &[Tag], content: &str) -> [u8; 32] {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    Sha256::digest(canonical.to_string().as_bytes()).into()
}

/// A signed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Check the id and signature.
    pub fn verify(&self) -> Result<(), EventError> {
        let id = compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if hex::encode(id) != self.id {
            return Err(EventError::IdMismatch);
        }
        let public = XOnlyPublicKey::from_str(&self.pubkey)
            .map_err(|e| EventError::InvalidPublicKey(e.to_string()))?;
        let sig = Signature::from_str(&self.sig).map_err(|e| EventError::InvalidSignature(e.to_string()))?;
        secp()
            .verify_schnorr(&sig, &Message::from_digest(id), &public)
            .map_err(|e| EventError::InvalidSignature(e.to_string()))
    }

    /// Parse an envelope from JSON.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        serde_json::from_str(json).map_err(|e| EventError::Malformed(e.to_string()))
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// First value of the first tag with this name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tag_values(name).next()
    }

    /// First values of every tag with this name.
    pub fn tag_values<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + use<'a, 'b> {
        self.tags
            .iter()
            .filter(move |tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }

    /// The `d` tag, or the empty string.
    pub fn identifier(&self) -> &str {
        self.tag_value("d").unwrap_or("")
    }

    /// Check whether this envelope supersedes `other` under replaceable rules:
    /// newer first, then lowest id.
    pub fn supersedes(&self, other: &Event) -> bool {
        self.created_at > other.created_at || (self.created_at == other.created_at && self.id < other.id)
    }
}

/// An envelope that has not been signed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    /// Filled in by the signer.
    #[serde(default)]
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Start an envelope stamped with the current time.
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            pubkey: String::new(),
            created_at: now_secs(),
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Append a `[name, value]` tag.
    pub fn tag(mut self, name: &str, value: impl Into<String>) -> Self {
        self.tags.push(vec![name.to_string(), value.into()]);
        self
    }

    /// Override the creation time.
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Sign with a local identity.
    pub fn sign(mut self, keys: &Keys) -> Event {
        self.pubkey = keys.public_key_hex();
        let id = compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        let sig = keys.sign_digest(id);
        Event {
            id: hex::encode(id),
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: sig.to_string(),
        }
    }
}
