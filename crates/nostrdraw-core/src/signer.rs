//! Signing capability shared by the sync protocols.
//!
//! A signer is either the local [`Keys`] or a paired remote signer that holds
//! the key on another device.

use crate::BoxFuture;
use crate::event::{Event, UnsignedEvent};
use crate::identity::Keys;
use std::sync::Arc;
use thiserror::Error;

/// Signing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    #[error("Signer rejected the request: {0}")]
    Rejected(String),
    #[error("Signer did not answer in time")]
    Timeout,
    #[error("Signer unreachable: {0}")]
    Transport(String),
    #[error("Invalid signer response: {0}")]
    InvalidResponse(String),
}

/// Something that can sign envelopes for one identity.
pub trait Signer: Send + Sync {
    /// Hex public key of the identity this signer signs for.
    fn public_key(&self) -> String;

    /// Sign an envelope as this identity.
    fn sign(&self, unsigned: UnsignedEvent) -> BoxFuture<'_, Result<Event, SignerError>>;
}

/// Shared signer handle.
pub type SharedSigner = Arc<dyn Signer>;

impl Signer for Keys {
    fn public_key(&self) -> String {
        self.public_key_hex()
    }

    fn sign(&self, unsigned: UnsignedEvent) -> BoxFuture<'_, Result<Event, SignerError>> {
        let event = unsigned.sign(self);
        Box::pin(async move { Ok(event) })
    }
}
