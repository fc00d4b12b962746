//! WebSocket relay client.
//!
//! One connection per relay, opened lazily on first use. A background task
//! owns the socket: it writes queued commands and routes incoming frames to
//! waiting publishers, queries and live subscriptions. When the socket drops,
//! every pending operation fails and live subscriptions end.

use super::message::{ClientMessage, RelayMessage};
use super::{EventSink, Relay, RelayError, RelayEvent, RelayListener, RelayResult};
use crate::BoxFuture;
use crate::event::{Event, Filter};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Default time allowed for the WebSocket handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time allowed for an `OK` or `EOSE` answer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingQuery {
    events: Vec<Event>,
    done: oneshot::Sender<RelayResult<Vec<Event>>>,
}

#[derive(Default)]
struct Routes {
    live: HashMap<String, EventSink>,
    queries: HashMap<String, PendingQuery>,
    publishes: HashMap<String, oneshot::Sender<RelayResult<()>>>,
}

#[derive(Clone)]
struct Connection {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    routes: Arc<Mutex<Routes>>,
    alive: Arc<AtomicBool>,
}

impl Connection {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        lock_routes(&self.routes)
    }

    fn send(&self, message: ClientMessage) -> RelayResult<()> {
        self.outgoing.send(message).map_err(|_| RelayError::Closed)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

fn lock_routes(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A relay reached over `ws://` or `wss://`.
pub struct WebSocketRelay {
    url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    connection: tokio::sync::Mutex<Option<Connection>>,
    next_subscription: AtomicU64,
}

impl WebSocketRelay {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connection: tokio::sync::Mutex::new(None),
            next_subscription: AtomicU64::new(0),
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, request: Duration) -> Self {
        self.connect_timeout = connect;
        self.request_timeout = request;
        self
    }

    /// Whether a live connection is currently open.
    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.as_ref().is_some_and(Connection::is_alive)
    }

    fn subscription_id(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.next_subscription.fetch_add(1, Ordering::SeqCst))
    }

    async fn connection(&self) -> RelayResult<Connection> {
        let mut current = self.connection.lock().await;
        if let Some(connection) = current.as_ref().filter(|c| c.is_alive()) {
            return Ok(connection.clone());
        }

        let parsed = Url::parse(&self.url).map_err(|e| RelayError::Connection(format!("Invalid URL: {}", e)))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(RelayError::Connection(format!(
                "Invalid WebSocket URL scheme: {}",
                parsed.scheme()
            )));
        }

        log::info!("Connecting to relay {}", self.url);
        let (socket, response) = timeout(self.connect_timeout, tokio_tungstenite::connect_async(self.url.as_str()))
            .await
            .map_err(|_| RelayError::Timeout)?
            .map_err(|e| RelayError::Connection(e.to_string()))?;
        log::debug!("Relay {} connected, status: {}", self.url, response.status());

        let (outgoing, commands) = mpsc::unbounded_channel();
        let connection = Connection {
            outgoing,
            routes: Arc::new(Mutex::new(Routes::default())),
            alive: Arc::new(AtomicBool::new(true)),
        };
        tokio::spawn(run_socket(
            self.url.clone(),
            socket,
            commands,
            connection.routes.clone(),
            connection.alive.clone(),
        ));

        *current = Some(connection.clone());
        Ok(connection)
    }
}

impl Relay for WebSocketRelay {
    fn url(&self) -> &str {
        &self.url
    }

    fn publish(&self, event: &Event) -> BoxFuture<'_, RelayResult<()>> {
        let event = event.clone();
        Box::pin(async move {
            let connection = self.connection().await?;
            let event_id = event.id.clone();
            let (tx, rx) = oneshot::channel();
            connection.routes().publishes.insert(event_id.clone(), tx);
            connection.send(ClientMessage::Event(event))?;

            match timeout(self.request_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RelayError::Closed),
                Err(_) => {
                    connection.routes().publishes.remove(&event_id);
                    Err(RelayError::Timeout)
                }
            }
        })
    }

    fn query(&self, filters: Vec<Filter>) -> BoxFuture<'_, RelayResult<Vec<Event>>> {
        Box::pin(async move {
            let connection = self.connection().await?;
            let subscription_id = self.subscription_id("q");
            let (done, rx) = oneshot::channel();
            connection.routes().queries.insert(
                subscription_id.clone(),
                PendingQuery {
                    events: Vec::new(),
                    done,
                },
            );
            connection.send(ClientMessage::Req {
                subscription_id: subscription_id.clone(),
                filters,
            })?;

            match timeout(self.request_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(RelayError::Closed),
                Err(_) => {
                    connection.routes().queries.remove(&subscription_id);
                    let _ = connection.send(ClientMessage::Close(subscription_id));
                    Err(RelayError::Timeout)
                }
            }
        })
    }

    fn subscribe(&self, filters: Vec<Filter>, sink: EventSink) -> BoxFuture<'_, RelayResult<RelayListener>> {
        Box::pin(async move {
            let connection = self.connection().await?;
            let subscription_id = self.subscription_id("s");
            connection.routes().live.insert(subscription_id.clone(), sink);
            connection.send(ClientMessage::Req {
                subscription_id: subscription_id.clone(),
                filters,
            })?;
            log::info!("Subscribed {} on {}", subscription_id, self.url);

            Ok(RelayListener::new(self.url.clone(), move || {
                let removed = connection.routes().live.remove(&subscription_id).is_some();
                if removed && connection.is_alive() {
                    let _ = connection.send(ClientMessage::Close(subscription_id));
                }
            }))
        })
    }
}

async fn run_socket<S>(
    url: String,
    socket: S,
    mut commands: mpsc::UnboundedReceiver<ClientMessage>,
    routes: Arc<Mutex<Routes>>,
    alive: Arc<AtomicBool>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(message) => {
                    if let Err(e) = write.send(Message::Text(message.to_json().into())).await {
                        log::warn!("{}: send error: {}", url, e);
                        break;
                    }
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Some(reply) = route_frame(&url, &routes, text.as_str()) else {
                        continue;
                    };
                    if let Err(e) = write.send(Message::Text(reply.to_json().into())).await {
                        log::warn!("{}: send error: {}", url, e);
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("{}: connection closed", url);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("{}: read error: {}", url, e);
                    break;
                }
            },
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Dropping the senders fails every waiter with `Closed`.
    *lock_routes(&routes) = Routes::default();
}

/// Dispatch one relay frame. Returns a message to send back, if any.
fn route_frame(url: &str, routes: &Mutex<Routes>, text: &str) -> Option<ClientMessage> {
    let message = match RelayMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            log::debug!("{}: dropping frame: {}", url, e);
            return None;
        }
    };

    let mut routes = lock_routes(routes);
    match message {
        RelayMessage::Event {
            subscription_id,
            event,
        } => {
            if let Err(e) = event.verify() {
                log::debug!("{}: dropping event {}: {}", url, event.id, e);
                return None;
            }
            if let Some(query) = routes.queries.get_mut(&subscription_id) {
                query.events.push(event);
            } else if let Some(sink) = routes.live.get(&subscription_id) {
                let delivered = sink.send(RelayEvent {
                    relay: url.to_string(),
                    event,
                });
                if delivered.is_err() {
                    routes.live.remove(&subscription_id);
                    return Some(ClientMessage::Close(subscription_id));
                }
            }
            None
        }
        RelayMessage::Eose(subscription_id) => {
            let query = routes.queries.remove(&subscription_id)?;
            let _ = query.done.send(Ok(query.events));
            Some(ClientMessage::Close(subscription_id))
        }
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            if let Some(waiter) = routes.publishes.remove(&event_id) {
                let result = if accepted {
                    Ok(())
                } else {
                    Err(RelayError::Rejected(message))
                };
                let _ = waiter.send(result);
            }
            None
        }
        RelayMessage::Closed {
            subscription_id,
            message,
        } => {
            if let Some(query) = routes.queries.remove(&subscription_id) {
                let _ = query.done.send(Err(RelayError::Rejected(message)));
            } else if routes.live.remove(&subscription_id).is_some() {
                log::warn!("{}: subscription {} closed by relay: {}", url, subscription_id, message);
            }
            None
        }
        RelayMessage::Notice(notice) => {
            log::info!("{}: notice: {}", url, notice);
            None
        }
    }
}
