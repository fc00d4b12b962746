//! NostrDraw development relay
//!
//! A small relay speaking the same envelope protocol as the public relays a
//! NostrDraw client talks to. Envelopes are kept in memory.
//!
//! ## Protocol
//!
//! Frames are JSON arrays:
//! ```json
//! ["EVENT", {"id": "...", "kind": 33333, ...}]
//! ["REQ", "sub-id", {"kinds": [33333], "#canvas": ["c1"]}]
//! ["CLOSE", "sub-id"]
//! ```
//! and the relay answers with `EVENT`, `OK`, `EOSE`, `CLOSED` and `NOTICE`.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use nostrdraw_core::event::{Event, Filter};
use nostrdraw_core::relay::{ClientMessage, EventStore, InsertOutcome, RelayMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_ADDR: &str = "0.0.0.0:7447";
const CHANNEL_CAPACITY: usize = 1024;
const BANNER: &str = "NostrDraw Relay - connect via WebSocket at /";

/// Shared relay state
struct AppState {
    store: Mutex<EventStore>,
    /// Accepted envelopes, fanned out to every connection.
    tx: broadcast::Sender<Event>,
    /// Open connections and their subscription counts.
    connections: DashMap<String, usize>,
}

impl AppState {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            store: Mutex::new(EventStore::new()),
            tx,
            connections: DashMap::new(),
        }
    }

    /// Store an envelope and hand it to live subscribers.
    fn accept(&self, event: Event) -> RelayMessage {
        let event_id = event.id.clone();
        let outcome = {
            let mut store = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            store.insert(event.clone())
        };
        match outcome {
            Ok(outcome) => {
                if outcome.is_broadcast() {
                    // No receivers is fine.
                    let _ = self.tx.send(event);
                }
                let message = match outcome {
                    InsertOutcome::Duplicate => "duplicate: already have this event",
                    InsertOutcome::Stale => "duplicate: have a newer version",
                    _ => "",
                };
                RelayMessage::Ok {
                    event_id,
                    accepted: true,
                    message: message.to_string(),
                }
            }
            Err(reason) => RelayMessage::Ok {
                event_id,
                accepted: false,
                message: reason,
            },
        }
    }

    fn stored(&self, filters: &[Filter]) -> Vec<Event> {
        let store = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        store.query(filters)
    }
}

/// Handle one client frame, updating the connection's subscriptions.
fn handle_frame(state: &AppState, subscriptions: &mut HashMap<String, Vec<Filter>>, text: &str) -> Vec<RelayMessage> {
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => return vec![RelayMessage::Notice(format!("invalid: {}", e))],
    };

    match message {
        ClientMessage::Event(event) => vec![state.accept(event)],
        ClientMessage::Req {
            subscription_id,
            filters,
        } => {
            let mut replies: Vec<RelayMessage> = state
                .stored(&filters)
                .into_iter()
                .map(|event| RelayMessage::Event {
                    subscription_id: subscription_id.clone(),
                    event,
                })
                .collect();
            replies.push(RelayMessage::Eose(subscription_id.clone()));
            subscriptions.insert(subscription_id, filters);
            replies
        }
        ClientMessage::Close(subscription_id) => {
            subscriptions.remove(&subscription_id);
            Vec::new()
        }
    }
}

/// Live frames for every subscription matching `event`.
fn live_frames(subscriptions: &HashMap<String, Vec<Filter>>, event: &Event) -> Vec<RelayMessage> {
    subscriptions
        .iter()
        .filter(|(_, filters)| filters.iter().any(|f| f.matches(event)))
        .map(|(id, _)| RelayMessage::Event {
            subscription_id: id.clone(),
            event: event.clone(),
        })
        .collect()
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nostrdraw_relay=info,tower_http=info".into()),
        )
        .init();

    let addr: SocketAddr = std::env::var("NOSTRDRAW_RELAY_ADDR")
        .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("NOSTRDRAW_RELAY_ADDR: {}", e)))?;

    let state = Arc::new(AppState::new());

    let app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("NostrDraw relay listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

/// WebSocket upgrade, or a banner for plain requests.
async fn root(State(state): State<Arc<AppState>>, ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(_) => BANNER.into_response(),
    }
}

/// Health check
async fn health(State(state): State<Arc<AppState>>) -> String {
    format!("ok {} connections", state.connections.len())
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let peer_id = Uuid::new_v4().to_string();
    state.connections.insert(peer_id.clone(), 0);
    info!("New connection: {}", peer_id);

    let (mut sender, mut receiver) = socket.split();
    let mut live = state.tx.subscribe();
    let mut subscriptions: HashMap<String, Vec<Filter>> = HashMap::new();

    'connection: loop {
        let replies = tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let replies = handle_frame(&state, &mut subscriptions, text.as_str());
                    state.connections.insert(peer_id.clone(), subscriptions.len());
                    replies
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("WebSocket error for {}: {}", peer_id, e);
                    break;
                }
            },
            event = live.recv() => match event {
                Ok(event) => live_frames(&subscriptions, &event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Connection {} lagged, skipped {} envelopes", peer_id, skipped);
                    Vec::new()
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        for reply in replies {
            if sender.send(Message::Text(reply.to_json().into())).await.is_err() {
                break 'connection;
            }
        }
    }

    state.connections.remove(&peer_id);
    info!("Connection closed: {} ({} subscriptions)", peer_id, subscriptions.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostrdraw_core::event::{UnsignedEvent, kinds};
    use nostrdraw_core::identity::Keys;

    fn action(keys: &Keys, canvas: &str) -> Event {
        UnsignedEvent::new(kinds::CANVAS_ACTION, "{}")
            .tag("d", canvas)
            .tag("canvas", canvas)
            .sign(keys)
    }

    fn req(id: &str, filter: Filter) -> String {
        ClientMessage::Req {
            subscription_id: id.to_string(),
            filters: vec![filter],
        }
        .to_json()
    }

    #[test]
    fn test_event_is_acknowledged_and_fanned_out() {
        let state = AppState::new();
        let mut live = state.tx.subscribe();
        let mut subs = HashMap::new();
        let event = action(&Keys::generate(), "c1");

        let replies = handle_frame(&state, &mut subs, &ClientMessage::Event(event.clone()).to_json());
        assert_eq!(
            replies,
            vec![RelayMessage::Ok {
                event_id: event.id.clone(),
                accepted: true,
                message: String::new()
            }]
        );
        assert_eq!(live.try_recv().unwrap(), event);

        let again = handle_frame(&state, &mut subs, &ClientMessage::Event(event.clone()).to_json());
        assert!(matches!(&again[0], RelayMessage::Ok { accepted: true, message, .. } if message.starts_with("duplicate")));
        assert!(live.try_recv().is_err());
    }

    #[test]
    fn test_forged_event_is_rejected() {
        let state = AppState::new();
        let mut forged = action(&Keys::generate(), "c1");
        forged.content = "{\"x\":1}".to_string();

        let replies = handle_frame(&state, &mut HashMap::new(), &ClientMessage::Event(forged).to_json());
        assert!(matches!(&replies[0], RelayMessage::Ok { accepted: false, .. }));
    }

    #[test]
    fn test_req_returns_stored_then_eose() {
        let state = AppState::new();
        let keys = Keys::generate();
        let mine = action(&keys, "c1");
        state.accept(mine.clone());
        state.accept(action(&keys, "c2"));

        let mut subs = HashMap::new();
        let filter = Filter::new().kind(kinds::CANVAS_ACTION).tag("canvas", ["c1"]);
        let replies = handle_frame(&state, &mut subs, &req("s1", filter));
        assert_eq!(
            replies,
            vec![
                RelayMessage::Event {
                    subscription_id: "s1".to_string(),
                    event: mine
                },
                RelayMessage::Eose("s1".to_string()),
            ]
        );
        assert_eq!(subs.len(), 1);

        let live = action(&Keys::generate(), "c1");
        assert_eq!(live_frames(&subs, &live).len(), 1);
        assert!(live_frames(&subs, &action(&keys, "c3")).is_empty());

        handle_frame(&state, &mut subs, &ClientMessage::Close("s1".to_string()).to_json());
        assert!(live_frames(&subs, &live).is_empty());
    }

    #[test]
    fn test_garbage_gets_notice() {
        let state = AppState::new();
        let replies = handle_frame(&state, &mut HashMap::new(), "[\"PING\"]");
        assert!(matches!(&replies[0], RelayMessage::Notice(_)));
    }
}
