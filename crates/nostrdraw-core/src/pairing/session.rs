//! Drives a [`PairingMachine`] against the relay pool.

use super::{PairedIdentity, PairingError, PairingMachine, PairingState};
use crate::clock::now_secs;
use crate::config::SyncConfig;
use crate::relay::{PoolSubscription, RelayPool};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Terminal outcome of a pairing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PairingEvent {
    Connected(PairedIdentity),
    Failed(PairingError),
}

type SharedMachine = Arc<Mutex<PairingMachine>>;

fn lock(machine: &Mutex<PairingMachine>) -> MutexGuard<'_, PairingMachine> {
    machine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Starts pairing attempts.
pub struct PairingSession;

impl PairingSession {
    /// Generate an ephemeral identity and listen for a peer on every relay.
    ///
    /// Fails right away if no relay accepted the listener. Later outcomes
    /// arrive through [`PairingHandle::next_event`].
    pub async fn start(pool: RelayPool, config: &SyncConfig) -> Result<PairingHandle, PairingError> {
        let machine: SharedMachine = Arc::new(Mutex::new(PairingMachine::new()));
        let (uri, filter) = {
            let mut m = lock(&machine);
            let uri = m.begin(&config.rendezvous_relay);
            (uri, m.listen_filter(now_secs(), config.handshake_lookback_secs))
        };
        let filter = filter.ok_or(PairingError::NotAwaiting)?;

        let subscription = match pool.subscribe(vec![filter]).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let error = PairingError::NoListener(e.to_string());
                lock(&machine).fail(error.to_string());
                return Err(error);
            }
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(
            machine.clone(),
            pool,
            subscription,
            events_tx,
            config.pairing_timeout(),
        ));

        Ok(PairingHandle {
            uri,
            machine,
            events,
            task: Some(task),
        })
    }
}

async fn drive(
    machine: SharedMachine,
    pool: RelayPool,
    mut subscription: PoolSubscription,
    events: mpsc::UnboundedSender<PairingEvent>,
    timeout: Duration,
) {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let outcome = loop {
        tokio::select! {
            received = subscription.recv() => {
                let Some(received) = received else {
                    break PairingEvent::Failed(PairingError::NoListener("all relays closed".to_string()));
                };
                let accepted = lock(&machine).handle_event(&received.event);
                let Some(accepted) = accepted else {
                    continue;
                };
                let report = pool.publish(&accepted.ack).await;
                if report.is_success() {
                    break PairingEvent::Connected(accepted.identity);
                }
                break PairingEvent::Failed(PairingError::AckUndelivered);
            }
            _ = &mut deadline => break PairingEvent::Failed(PairingError::TimedOut),
        }
    };

    subscription.close();
    if let PairingEvent::Failed(error) = &outcome {
        lock(&machine).fail(error.to_string());
    }
    let _ = events.send(outcome);
}

/// A running pairing attempt.
///
/// Cancelling closes every listener and discards the ephemeral identity.
/// Dropping the handle cancels.
pub struct PairingHandle {
    uri: String,
    machine: SharedMachine,
    events: mpsc::UnboundedReceiver<PairingEvent>,
    task: Option<JoinHandle<()>>,
}

impl PairingHandle {
    /// The `nostrconnect://` URI to show to the other device.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> PairingState {
        lock(&self.machine).state().clone()
    }

    /// Wait for the outcome. `None` after cancellation.
    pub async fn next_event(&mut self) -> Option<PairingEvent> {
        self.events.recv().await
    }

    /// Abandon the attempt. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let mut machine = lock(&self.machine);
            if !matches!(machine.state(), PairingState::Connected(_)) {
                machine.cancel();
            }
        }
    }
}

impl Drop for PairingHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keys;
    use crate::pairing::handshake_event;
    use crate::relay::{MemoryRelay, Relay};

    fn pool_of(relays: &[MemoryRelay]) -> RelayPool {
        RelayPool::new(relays.iter().map(|r| Arc::new(r.clone()) as Arc<dyn Relay>).collect())
    }

    fn ephemeral_of(uri: &str) -> String {
        let rest = uri.trim_start_matches("nostrconnect://");
        rest.split('?').next().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_listens_on_every_relay() {
        let a = MemoryRelay::new("mem://a");
        let b = MemoryRelay::new("mem://b");
        let mut handle = PairingSession::start(pool_of(&[a.clone(), b.clone()]), &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(a.listener_count(), 1);
        assert_eq!(b.listener_count(), 1);
        assert_eq!(handle.state(), PairingState::AwaitingPeer);

        // The peer only reaches the relay that is not advertised.
        let peer = Keys::generate();
        let hello = handshake_event(&peer, &ephemeral_of(handle.uri()), r#"{"method":"connect","id":"1"}"#).unwrap();
        b.publish(&hello).await.unwrap();

        match handle.next_event().await {
            Some(PairingEvent::Connected(identity)) => assert_eq!(identity.remote_pubkey, peer.public_key_hex()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(a.listener_count() + b.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_no_listener_fails_immediately() {
        let down = MemoryRelay::new("mem://down");
        down.set_online(false);
        let result = PairingSession::start(pool_of(&[down]), &SyncConfig::default()).await;
        assert!(matches!(result, Err(PairingError::NoListener(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let relay = MemoryRelay::new("mem://a");
        let config = SyncConfig {
            pairing_timeout_ms: 1_000,
            ..SyncConfig::default()
        };
        let mut handle = PairingSession::start(pool_of(&[relay.clone()]), &config).await.unwrap();

        assert_eq!(handle.next_event().await, Some(PairingEvent::Failed(PairingError::TimedOut)));
        assert!(matches!(handle.state(), PairingState::Failed(_)));
        assert_eq!(relay.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_tears_down() {
        let relay = MemoryRelay::new("mem://a");
        let mut handle = PairingSession::start(pool_of(&[relay.clone()]), &SyncConfig::default())
            .await
            .unwrap();

        handle.cancel();
        handle.cancel();
        assert_eq!(handle.state(), PairingState::Idle);
        assert_eq!(handle.next_event().await, None);
        // The aborted task drops its subscription.
        tokio::task::yield_now().await;
        assert_eq!(relay.listener_count(), 0);
    }
}
