//! In-process relay.
//!
//! [`EventStore`] applies the relay storage rules and is shared with the
//! relay binary. [`MemoryRelay`] wraps it behind the [`Relay`] trait for
//! tests and offline use.

use super::{EventSink, Relay, RelayError, RelayEvent, RelayListener, RelayResult};
use crate::BoxFuture;
use crate::event::{Event, Filter, is_addressable, is_ephemeral, is_replaceable};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// What happened to an envelope offered to an [`EventStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored as a new envelope.
    Stored,
    /// Stored, superseding an older replaceable envelope.
    Replaced,
    /// Already known.
    Duplicate,
    /// A newer replaceable envelope is already stored. Still forwarded live.
    Stale,
    /// Forwarded but never stored.
    Ephemeral,
}

impl InsertOutcome {
    /// Whether live subscribers should see the envelope.
    ///
    /// Action envelopes share one replaceable slot per author and canvas, so
    /// two edits within the same second can lose the storage race. The loser
    /// must still reach live subscribers.
    pub fn is_broadcast(&self) -> bool {
        !matches!(self, InsertOutcome::Duplicate)
    }
}

/// Stored envelopes with replaceable and ephemeral handling.
#[derive(Debug, Default)]
pub struct EventStore {
    events: HashMap<String, Event>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify and store an envelope.
    ///
    /// Returns the rejection reason for envelopes that fail verification.
    pub fn insert(&mut self, event: Event) -> Result<InsertOutcome, String> {
        event.verify().map_err(|e| format!("invalid: {}", e))?;

        if is_ephemeral(event.kind) {
            return Ok(InsertOutcome::Ephemeral);
        }
        if self.events.contains_key(&event.id) {
            return Ok(InsertOutcome::Duplicate);
        }

        let slot = |other: &Event| {
            other.kind == event.kind
                && other.pubkey == event.pubkey
                && (!is_addressable(event.kind) || other.identifier() == event.identifier())
        };
        if is_replaceable(event.kind) || is_addressable(event.kind) {
            let previous: Vec<Event> = self.events.values().filter(|e| slot(e)).cloned().collect();
            if previous.iter().any(|p| p.supersedes(&event)) {
                return Ok(InsertOutcome::Stale);
            }
            for old in &previous {
                self.events.remove(&old.id);
            }
            self.events.insert(event.id.clone(), event);
            return Ok(if previous.is_empty() {
                InsertOutcome::Stored
            } else {
                InsertOutcome::Replaced
            });
        }

        self.events.insert(event.id.clone(), event);
        Ok(InsertOutcome::Stored)
    }

    /// Stored envelopes matching any filter, newest first.
    ///
    /// Each filter's `limit` caps its own contribution.
    pub fn query(&self, filters: &[Filter]) -> Vec<Event> {
        let mut newest_first: Vec<&Event> = self.events.values().collect();
        newest_first.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut found: HashMap<&str, &Event> = HashMap::new();
        for filter in filters {
            let limit = filter.limit.unwrap_or(usize::MAX);
            for event in newest_first.iter().filter(|e| filter.matches(e)).take(limit) {
                found.insert(event.id.as_str(), event);
            }
        }

        let mut result: Vec<Event> = found.into_values().cloned().collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        result
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

struct Listener {
    filters: Vec<Filter>,
    sink: EventSink,
}

#[derive(Default)]
struct MemoryState {
    store: EventStore,
    listeners: HashMap<u64, Listener>,
    next_listener: u64,
    offline: bool,
    accepted: Vec<Event>,
}

/// A relay living in this process.
///
/// Clones share the same state.
#[derive(Clone)]
pub struct MemoryRelay {
    url: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate the relay becoming unreachable, or reachable again.
    ///
    /// Going offline drops every live subscription.
    pub fn set_online(&self, online: bool) {
        let mut state = self.state();
        state.offline = !online;
        if !online {
            state.listeners.clear();
        }
    }

    /// Every envelope this relay accepted, including ephemeral ones.
    pub fn accepted(&self) -> Vec<Event> {
        self.state().accepted.clone()
    }

    /// Envelopes currently stored.
    pub fn stored(&self) -> Vec<Event> {
        self.state().store.query(&[Filter::new()])
    }

    /// Number of open subscriptions.
    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    fn check_online(&self) -> RelayResult<()> {
        if self.state().offline {
            Err(RelayError::Offline)
        } else {
            Ok(())
        }
    }
}

impl Relay for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    fn publish(&self, event: &Event) -> BoxFuture<'_, RelayResult<()>> {
        let event = event.clone();
        Box::pin(async move {
            self.check_online()?;
            let mut state = self.state();
            let outcome = state.store.insert(event.clone()).map_err(RelayError::Rejected)?;
            log::debug!("{}: {:?} kind {} {}", self.url, outcome, event.kind, event.id);

            if outcome.is_broadcast() {
                state.accepted.push(event.clone());
                let url = self.url.clone();
                state.listeners.retain(|_, listener| {
                    if !listener.filters.iter().any(|f| f.matches(&event)) {
                        return true;
                    }
                    listener
                        .sink
                        .send(RelayEvent {
                            relay: url.clone(),
                            event: event.clone(),
                        })
                        .is_ok()
                });
            }
            Ok(())
        })
    }

    fn query(&self, filters: Vec<Filter>) -> BoxFuture<'_, RelayResult<Vec<Event>>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(self.state().store.query(&filters))
        })
    }

    fn subscribe(&self, filters: Vec<Filter>, sink: EventSink) -> BoxFuture<'_, RelayResult<RelayListener>> {
        Box::pin(async move {
            self.check_online()?;
            let mut state = self.state();
            for event in state.store.query(&filters).into_iter().rev() {
                let _ = sink.send(RelayEvent {
                    relay: self.url.clone(),
                    event,
                });
            }

            let id = state.next_listener;
            state.next_listener += 1;
            state.listeners.insert(id, Listener { filters, sink });

            let shared = Arc::downgrade(&self.state);
            Ok(RelayListener::new(self.url.clone(), move || {
                if let Some(shared) = shared.upgrade() {
                    let mut state = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    state.listeners.remove(&id);
                }
            }))
        })
    }
}
