//! Signing through a paired device.

use super::{PairedIdentity, PairingError, RpcRequest, RpcResponse, handshake_event, open_handshake};
use crate::BoxFuture;
use crate::clock::now_secs;
use crate::event::{Event, Filter, UnsignedEvent, kinds};
use crate::identity::parse_public_key;
use crate::relay::RelayPool;
use crate::signer::{Signer, SignerError};
use serde_json::Value;
use std::time::Duration;

/// Clock skew tolerated when listening for responses.
const RESPONSE_SKEW_SECS: u64 = 5;

/// A [`Signer`] whose key lives on another device.
///
/// Each signature is a `sign_event` request sent over the encrypted
/// channel established by pairing.
pub struct RemoteSigner {
    pool: RelayPool,
    identity: PairedIdentity,
    timeout: Duration,
}

impl RemoteSigner {
    pub fn new(pool: RelayPool, identity: PairedIdentity, timeout: Duration) -> Result<Self, PairingError> {
        parse_public_key(&identity.remote_pubkey)?;
        Ok(Self {
            pool,
            identity,
            timeout,
        })
    }

    pub fn identity(&self) -> &PairedIdentity {
        &self.identity
    }

    async fn request_signature(&self, mut unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        let remote = self.identity.remote_pubkey.clone();
        let channel = self.identity.channel_keys();
        unsigned.pubkey = remote.clone();

        let event_json = serde_json::to_string(&unsigned).map_err(|e| SignerError::Transport(e.to_string()))?;
        let request = RpcRequest {
            id: uuid::Uuid::new_v4().to_string(),
            method: "sign_event".to_string(),
            params: vec![Value::String(event_json)],
        };
        let payload = serde_json::to_string(&request).map_err(|e| SignerError::Transport(e.to_string()))?;

        // Listen before asking so a fast answer is not missed.
        let filter = Filter::new()
            .kind(kinds::PAIRING_HANDSHAKE)
            .authors([remote.as_str()])
            .tag("p", [channel.public_key_hex()])
            .since(now_secs().saturating_sub(RESPONSE_SKEW_SECS));
        let mut responses = self
            .pool
            .subscribe(vec![filter])
            .await
            .map_err(|e| SignerError::Transport(e.to_string()))?;

        let envelope = handshake_event(channel, &remote, &payload).map_err(|e| SignerError::Transport(e.to_string()))?;
        let report = self.pool.publish(&envelope).await;
        if !report.is_success() {
            responses.close();
            return Err(SignerError::Transport("no relay accepted the request".to_string()));
        }

        let wait = async {
            while let Some(received) = responses.recv().await {
                let response = match open_handshake(channel, &received.event)
                    .and_then(|json| serde_json::from_str::<RpcResponse>(&json).map_err(|e| PairingError::Malformed(e.to_string())))
                {
                    Ok(response) => response,
                    Err(e) => {
                        log::debug!("Remote signer: ignoring {}: {}", received.event.id, e);
                        continue;
                    }
                };
                if response.id == request.id {
                    return Ok(response);
                }
            }
            Err(SignerError::Transport("all relays closed".to_string()))
        };
        let response = tokio::time::timeout(self.timeout, wait).await;
        responses.close();
        let response = response.map_err(|_| SignerError::Timeout)??;

        if let Some(error) = response.error {
            return Err(SignerError::Rejected(error));
        }
        let result = response
            .result
            .ok_or_else(|| SignerError::InvalidResponse("empty result".to_string()))?;
        let event = Event::from_json(&result).map_err(|e| SignerError::InvalidResponse(e.to_string()))?;
        event
            .verify()
            .map_err(|e| SignerError::InvalidResponse(e.to_string()))?;
        if event.pubkey != remote {
            return Err(SignerError::InvalidResponse(format!("signed by {}", event.pubkey)));
        }
        Ok(event)
    }
}

impl Signer for RemoteSigner {
    fn public_key(&self) -> String {
        self.identity.remote_pubkey.clone()
    }

    fn sign(&self, unsigned: UnsignedEvent) -> BoxFuture<'_, Result<Event, SignerError>> {
        Box::pin(self.request_signature(unsigned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;
    use crate::pairing::{HandshakeRequest, PairingMachine};
    use crate::relay::{MemoryRelay, Relay, RelayEvent};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Pair a fresh machine with `remote` and return the identity.
    fn paired_with(remote: &Keys) -> PairedIdentity {
        let mut machine = PairingMachine::new();
        machine.begin("mem://a");
        let ephemeral = machine.ephemeral_pubkey().unwrap();
        let hello = handshake_event(remote, &ephemeral, r#"{"method":"connect","id":"1"}"#).unwrap();
        machine.handle_event(&hello).unwrap().identity
    }

    /// Answer sign requests as `remote`. With `refuse`, every request is rejected.
    async fn run_bunker(relay: MemoryRelay, remote: Keys, refuse: bool) {
        let (sink, mut inbox) = mpsc::unbounded_channel();
        let filter = Filter::new()
            .kind(kinds::PAIRING_HANDSHAKE)
            .tag("p", [remote.public_key_hex()]);
        let _listener = relay.subscribe(vec![filter], sink).await.unwrap();

        while let Some(RelayEvent { event, .. }) = inbox.recv().await {
            let Ok(json) = open_handshake(&remote, &event) else {
                continue;
            };
            let Ok(HandshakeRequest::SignEvent { id, event: unsigned }) = HandshakeRequest::decode(&json) else {
                continue;
            };
            let response = if refuse {
                RpcResponse::error(id, "denied")
            } else {
                RpcResponse::ok(id, unsigned.sign(&remote).to_json())
            };
            let reply = handshake_event(&remote, &event.pubkey, &serde_json::to_string(&response).unwrap()).unwrap();
            relay.publish(&reply).await.unwrap();
        }
    }

    fn signer_for(relay: &MemoryRelay, identity: PairedIdentity, timeout: Duration) -> RemoteSigner {
        let pool = RelayPool::new(vec![Arc::new(relay.clone()) as Arc<dyn Relay>]);
        RemoteSigner::new(pool, identity, timeout).unwrap()
    }

    #[tokio::test]
    async fn test_remote_signature() {
        let relay = MemoryRelay::new("mem://a");
        let remote = Keys::generate();
        let bunker = tokio::spawn(run_bunker(relay.clone(), remote.clone(), false));
        tokio::task::yield_now().await;

        let signer = signer_for(&relay, paired_with(&remote), Duration::from_secs(5));
        assert_eq!(signer.public_key(), remote.public_key_hex());

        let event = signer
            .sign(UnsignedEvent::new(kinds::CANVAS_ACTION, "{}").tag("canvas", "c1"))
            .await
            .unwrap();
        assert_eq!(event.pubkey, remote.public_key_hex());
        assert_eq!(event.tag_value("canvas"), Some("c1"));
        assert!(event.verify().is_ok());
        bunker.abort();
    }

    #[tokio::test]
    async fn test_remote_refusal() {
        let relay = MemoryRelay::new("mem://a");
        let remote = Keys::generate();
        let bunker = tokio::spawn(run_bunker(relay.clone(), remote.clone(), true));
        tokio::task::yield_now().await;

        let signer = signer_for(&relay, paired_with(&remote), Duration::from_secs(5));
        let result = signer.sign(UnsignedEvent::new(kinds::CANVAS_ACTION, "{}")).await;
        assert_eq!(result, Err(SignerError::Rejected("denied".to_string())));
        bunker.abort();
    }

    #[tokio::test]
    async fn test_silent_remote_times_out() {
        let relay = MemoryRelay::new("mem://a");
        let signer = signer_for(&relay, paired_with(&Keys::generate()), Duration::from_millis(50));
        let result = signer.sign(UnsignedEvent::new(kinds::CANVAS_ACTION, "{}")).await;
        assert_eq!(result, Err(SignerError::Timeout));
        assert_eq!(relay.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_relays() {
        let relay = MemoryRelay::new("mem://down");
        relay.set_online(false);
        let signer = signer_for(&relay, paired_with(&Keys::generate()), Duration::from_secs(1));
        let result = signer.sign(UnsignedEvent::new(kinds::CANVAS_ACTION, "{}")).await;
        assert!(matches!(result, Err(SignerError::Transport(_))));
    }
}
