//! Device pairing.
//!
//! A pairing attempt generates an ephemeral identity and advertises it in a
//! `nostrconnect://` URI. The other device sends an encrypted `connect`
//! request addressed to that identity; its author becomes the trusted remote
//! signer and receives an encrypted acknowledgement.
//!
//! [`PairingMachine`] holds the state and transitions and does no I/O.
//! [`PairingSession`] drives it against a relay pool.

mod remote_signer;
mod session;

pub use remote_signer::RemoteSigner;
pub use session::{PairingEvent, PairingHandle, PairingSession};

use crate::crypto::{self, CryptoError};
use crate::event::{Event, Filter, UnsignedEvent, kinds};
use crate::identity::{IdentityError, Keys, parse_public_key};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// URI scheme of pairing links.
pub const CONNECT_SCHEME: &str = "nostrconnect";

/// Acknowledgement result for a `connect` request.
pub const ACK: &str = "ack";

/// Pairing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("No relay accepted the pairing listener: {0}")]
    NoListener(String),
    #[error("No relay accepted the acknowledgement")]
    AckUndelivered,
    #[error("Pairing timed out")]
    TimedOut,
    #[error("No pairing attempt in progress")]
    NotAwaiting,
    #[error("Encryption error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Invalid identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("Malformed handshake: {0}")]
    Malformed(String),
}

/// Build the pairing URI for an ephemeral public key and rendezvous relay.
pub fn connection_uri(ephemeral_pubkey: &str, relay: &str) -> String {
    let relay: String = url::form_urlencoded::byte_serialize(relay.as_bytes()).collect();
    format!("{}://{}?relay={}", CONNECT_SCHEME, ephemeral_pubkey, relay)
}

/// Request payload `{id, method, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// Response payload `{id, result, error}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RpcResponse {
    pub fn ok(id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }
}

/// A decoded handshake request.
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeRequest {
    Connect { id: String },
    SignEvent { id: String, event: UnsignedEvent },
    /// A method this side does not handle.
    Other { id: String, method: String },
}

impl HandshakeRequest {
    pub fn decode(json: &str) -> Result<Self, PairingError> {
        let request: RpcRequest = serde_json::from_str(json).map_err(|e| PairingError::Malformed(e.to_string()))?;
        match request.method.as_str() {
            "connect" => Ok(HandshakeRequest::Connect { id: request.id }),
            "sign_event" => {
                let param = request
                    .params
                    .into_iter()
                    .next()
                    .ok_or_else(|| PairingError::Malformed("sign_event without event".to_string()))?;
                let event = match param {
                    Value::String(json) => serde_json::from_str(&json),
                    other => serde_json::from_value(other),
                }
                .map_err(|e| PairingError::Malformed(e.to_string()))?;
                Ok(HandshakeRequest::SignEvent { id: request.id, event })
            }
            _ => Ok(HandshakeRequest::Other {
                id: request.id,
                method: request.method,
            }),
        }
    }
}

/// Seal a payload for `recipient` and sign it as `sender`.
pub fn handshake_event(sender: &Keys, recipient: &str, payload: &str) -> Result<Event, PairingError> {
    let peer = parse_public_key(recipient)?;
    let content = crypto::encrypt(sender.secret_key(), &peer, payload)?;
    Ok(UnsignedEvent::new(kinds::PAIRING_HANDSHAKE, content)
        .tag("p", recipient)
        .sign(sender))
}

/// Open a handshake envelope addressed to `recipient`.
pub fn open_handshake(recipient: &Keys, event: &Event) -> Result<String, PairingError> {
    let sender = parse_public_key(&event.pubkey)?;
    Ok(crypto::decrypt(recipient.secret_key(), &sender, &event.content)?)
}

/// The outcome of a successful pairing.
///
/// Holds the remote identity and the channel keys used to talk to it.
#[derive(Clone, PartialEq)]
pub struct PairedIdentity {
    pub remote_pubkey: String,
    channel: Keys,
}

impl PairedIdentity {
    /// Keys of the local end of the encrypted channel.
    pub fn channel_keys(&self) -> &Keys {
        &self.channel
    }
}

impl fmt::Debug for PairedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairedIdentity")
            .field("remote_pubkey", &self.remote_pubkey)
            .finish_non_exhaustive()
    }
}

/// Pairing states.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingState {
    Idle,
    AwaitingPeer,
    Connected(PairedIdentity),
    Failed(String),
}

/// A handshake that was accepted.
#[derive(Debug, Clone)]
pub struct Accepted {
    pub identity: PairedIdentity,
    /// Encrypted acknowledgement to publish.
    pub ack: Event,
}

/// Pairing state machine.
pub struct PairingMachine {
    state: PairingState,
    ephemeral: Option<Keys>,
    relay: String,
}

impl Default for PairingMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingMachine {
    pub fn new() -> Self {
        Self {
            state: PairingState::Idle,
            ephemeral: None,
            relay: String::new(),
        }
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    /// Start a new attempt with a fresh ephemeral identity, replacing any
    /// previous one. Returns the connection URI.
    pub fn begin(&mut self, rendezvous_relay: &str) -> String {
        self.begin_with(Keys::generate(), rendezvous_relay)
    }

    /// Start a new attempt with the given ephemeral identity.
    pub fn begin_with(&mut self, ephemeral: Keys, rendezvous_relay: &str) -> String {
        let uri = connection_uri(&ephemeral.public_key_hex(), rendezvous_relay);
        log::info!("Pairing: awaiting peer at {}", ephemeral.npub());
        self.ephemeral = Some(ephemeral);
        self.relay = rendezvous_relay.to_string();
        self.state = PairingState::AwaitingPeer;
        uri
    }

    /// Hex public key of the current ephemeral identity.
    pub fn ephemeral_pubkey(&self) -> Option<String> {
        self.ephemeral.as_ref().map(Keys::public_key_hex)
    }

    /// URI of the current attempt.
    pub fn uri(&self) -> Option<String> {
        self.ephemeral_pubkey().map(|pk| connection_uri(&pk, &self.relay))
    }

    /// Filter for handshakes addressed to the ephemeral identity, created
    /// no earlier than `lookback_secs` before `now`.
    pub fn listen_filter(&self, now: u64, lookback_secs: u64) -> Option<Filter> {
        let pubkey = self.ephemeral_pubkey()?;
        Some(
            Filter::new()
                .kind(kinds::PAIRING_HANDSHAKE)
                .tag("p", [pubkey])
                .since(now.saturating_sub(lookback_secs)),
        )
    }

    /// Process a candidate handshake.
    ///
    /// Anything that fails to decrypt or decode is logged and ignored. A
    /// `connect` moves the machine to `Connected` and returns the
    /// acknowledgement to send.
    pub fn handle_event(&mut self, event: &Event) -> Option<Accepted> {
        if self.state != PairingState::AwaitingPeer {
            return None;
        }
        let ephemeral = self.ephemeral.as_ref()?;
        let own = ephemeral.public_key_hex();
        if event.kind != kinds::PAIRING_HANDSHAKE || !event.tag_values("p").any(|p| p == own) {
            return None;
        }

        let request = match open_handshake(ephemeral, event).and_then(|json| HandshakeRequest::decode(&json)) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("Pairing: ignoring {} from {}: {}", event.id, event.pubkey, e);
                return None;
            }
        };
        let id = match request {
            HandshakeRequest::Connect { id } => id,
            other => {
                log::debug!("Pairing: ignoring {:?} before connect", other);
                return None;
            }
        };

        let reply = serde_json::to_string(&RpcResponse::ok(id, ACK)).ok()?;
        let ack = match handshake_event(ephemeral, &event.pubkey, &reply) {
            Ok(ack) => ack,
            Err(e) => {
                log::debug!("Pairing: cannot answer {}: {}", event.pubkey, e);
                return None;
            }
        };

        let identity = PairedIdentity {
            remote_pubkey: event.pubkey.clone(),
            channel: ephemeral.clone(),
        };
        log::info!("Pairing: connected to {}", identity.remote_pubkey);
        self.ephemeral = None;
        self.state = PairingState::Connected(identity.clone());
        Some(Accepted { identity, ack })
    }

    /// Move to `Failed`, discarding the ephemeral identity.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        log::warn!("Pairing failed: {}", reason);
        self.ephemeral = None;
        self.state = PairingState::Failed(reason);
    }

    /// Back to `Idle`, discarding the ephemeral identity. Safe to repeat.
    pub fn cancel(&mut self) {
        if self.state != PairingState::Idle {
            log::info!("Pairing cancelled");
        }
        self.ephemeral = None;
        self.state = PairingState::Idle;
    }
}
