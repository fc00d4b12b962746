//! Relay transport.
//!
//! A relay stores and forwards envelopes. Every relay is independently
//! operated and may be unreachable, so the [`RelayPool`] fans each operation
//! out to all configured relays and isolates their failures.

mod memory;
mod message;
mod pool;
mod websocket;

pub use memory::{EventStore, InsertOutcome, MemoryRelay};
pub use message::{ClientMessage, MessageError, RelayMessage};
pub use pool::{PoolSubscription, PublishReport, RelayPool, SubscriptionHandle};
pub use websocket::WebSocketRelay;

use crate::BoxFuture;
use crate::event::{Event, Filter};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Relay errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Relay did not answer in time")]
    Timeout,
    #[error("Relay rejected the event: {0}")]
    Rejected(String),
    #[error("Connection closed")]
    Closed,
    #[error("Relay is offline")]
    Offline,
    #[error("No relay available: {0}")]
    Unavailable(String),
}

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// An envelope delivered by a subscription, with the relay it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEvent {
    pub relay: String,
    pub event: Event,
}

/// Channel end that receives subscription traffic.
pub type EventSink = mpsc::UnboundedSender<RelayEvent>;

/// A store-and-forward relay endpoint.
pub trait Relay: Send + Sync {
    /// Relay URL, used in logs and reports.
    fn url(&self) -> &str;

    /// Send an envelope and wait for the relay's acknowledgement.
    fn publish(&self, event: &Event) -> BoxFuture<'_, RelayResult<()>>;

    /// Fetch the stored envelopes matching any filter.
    fn query(&self, filters: Vec<Filter>) -> BoxFuture<'_, RelayResult<Vec<Event>>>;

    /// Deliver stored, then live, envelopes matching any filter into `sink`
    /// until the returned listener is closed.
    fn subscribe(&self, filters: Vec<Filter>, sink: EventSink) -> BoxFuture<'_, RelayResult<RelayListener>>;
}

/// Teardown handle for one relay subscription.
///
/// Closing is idempotent and also happens on drop.
pub struct RelayListener {
    relay: String,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl RelayListener {
    pub fn new(relay: impl Into<String>, closer: impl FnOnce() + Send + 'static) -> Self {
        Self {
            relay: relay.into(),
            closer: Some(Box::new(closer)),
        }
    }

    /// URL of the relay this listener belongs to.
    pub fn relay(&self) -> &str {
        &self.relay
    }

    /// Stop the subscription.
    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            log::debug!("closing listener on {}", self.relay);
            closer();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_none()
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for RelayListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayListener")
            .field("relay", &self.relay)
            .field("closed", &self.is_closed())
            .finish()
    }
}
