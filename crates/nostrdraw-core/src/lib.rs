//! NostrDraw Core Library
//!
//! Element store, relay sync, presence, checkpoints and device pairing for
//! the NostrDraw shared canvas.

pub mod client;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod elements;
pub mod event;
pub mod identity;
pub mod pairing;
pub mod presence;
pub mod relay;
pub mod session;
pub mod signer;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod sync;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by object-safe async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use client::{ClientError, DrawClient};
pub use config::SyncConfig;
pub use elements::{CanvasElement, ElementPatch};
pub use event::{Event, Filter, UnsignedEvent, kinds};
pub use identity::Keys;
pub use pairing::{PairingEvent, PairingMachine, PairingSession, PairingState, RemoteSigner};
pub use presence::{OverlayLayer, PresenceChannel};
pub use relay::{MemoryRelay, RelayPool, WebSocketRelay};
pub use session::CanvasSession;
pub use signer::{SharedSigner, Signer};
pub use snapshot::{AutoSaveManager, CanvasCheckpoint, SnapshotService};
pub use store::{ElementStore, SharedStore};
pub use sync::{Action, ActionLog};
