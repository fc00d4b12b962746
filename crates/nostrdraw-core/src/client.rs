//! Application-facing entry point tying identity, store and sync together.

use crate::clock::now_millis;
use crate::config::{ConfigError, SyncConfig};
use crate::elements::{CanvasElement, ElementPatch};
use crate::identity::{IdentityError, Keys};
use crate::pairing::{PairedIdentity, PairingError, RemoteSigner};
use crate::presence::{OverlayLayer, PresenceChannel, SharedPresence, SweeperHandle};
use crate::relay::{PublishReport, RelayPool};
use crate::session::CanvasSession;
use crate::signer::SharedSigner;
use crate::snapshot::{AutoSaveManager, CanvasCheckpoint, CheckpointSummary, SnapshotError, SnapshotService};
use crate::storage::{FileStorage, SessionMemory, Storage, StorageError, UserRecord};
use crate::store::SharedStore;
use crate::sync::{Action, ActionLog, SyncError};
use std::sync::Arc;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("No canvas is open")]
    NoCanvas,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Everything bound to the logged-in identity.
struct Account {
    signer: SharedSigner,
    actions: Arc<ActionLog>,
    presence: Arc<PresenceChannel>,
    snapshots: Arc<SnapshotService>,
    autosave: AutoSaveManager,
}

/// The open canvas.
struct OpenCanvas {
    session: CanvasSession,
    sweeper: SweeperHandle,
}

/// A NostrDraw client.
///
/// Owns the relay pool, the element store and the overlay layer for the
/// whole process. Logging in binds a signer; opening a canvas starts live
/// sync for it.
pub struct DrawClient {
    config: SyncConfig,
    pool: RelayPool,
    store: SharedStore,
    overlay: OverlayLayer,
    memory: SessionMemory,
    account: Option<Account>,
    canvas: Option<OpenCanvas>,
}

impl DrawClient {
    pub fn new(config: SyncConfig, pool: RelayPool, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            pool,
            store: SharedStore::new(),
            overlay: OverlayLayer::new(),
            memory: SessionMemory::new(storage),
            account: None,
            canvas: None,
        }
    }

    /// Validate `config`, connect to its relays and keep session state in
    /// the platform data directory.
    pub fn from_config(config: SyncConfig) -> ClientResult<Self> {
        config.validate()?;
        let pool = RelayPool::from_config(&config);
        let storage = Arc::new(FileStorage::default_location()?);
        Ok(Self::new(config, pool, storage))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn overlay(&self) -> &OverlayLayer {
        &self.overlay
    }

    pub fn session_memory(&self) -> &SessionMemory {
        &self.memory
    }

    pub fn is_logged_in(&self) -> bool {
        self.account.is_some()
    }

    /// Hex public key of the logged-in identity.
    pub fn public_key(&self) -> Option<String> {
        self.account.as_ref().map(|account| account.signer.public_key())
    }

    pub fn presence(&self) -> Option<SharedPresence> {
        self.account.as_ref().map(|account| account.presence.book())
    }

    pub fn canvas_id(&self) -> Option<&str> {
        self.canvas.as_ref().map(|open| open.session.canvas_id())
    }

    /// Log in with a local secret key (`nsec1…` or hex).
    pub async fn login_with_secret(&mut self, secret: &str) -> ClientResult<UserRecord> {
        let keys = Keys::parse(secret)?;
        self.login_with_signer(Arc::new(keys)).await
    }

    /// Log in through a paired device.
    pub async fn login_with_pairing(&mut self, identity: PairedIdentity) -> ClientResult<UserRecord> {
        let signer = RemoteSigner::new(self.pool.clone(), identity, self.config.remote_sign_timeout())?;
        self.login_with_signer(Arc::new(signer)).await
    }

    /// Bind a signer and remember the identity.
    ///
    /// Any previously open canvas is closed.
    pub async fn login_with_signer(&mut self, signer: SharedSigner) -> ClientResult<UserRecord> {
        let user = UserRecord::from_pubkey(&signer.public_key())?;
        self.close_canvas();

        let actions = Arc::new(ActionLog::new(self.pool.clone(), signer.clone(), self.store.clone()));
        let presence = Arc::new(PresenceChannel::new(
            self.pool.clone(),
            signer.clone(),
            self.config.cursor_interval(),
        ));
        let snapshots = Arc::new(SnapshotService::new(self.pool.clone(), signer.clone(), self.store.clone()));
        let mut autosave = AutoSaveManager::new(snapshots.clone());
        autosave.set_interval(self.config.autosave_interval());

        self.account = Some(Account {
            signer,
            actions,
            presence,
            snapshots,
            autosave,
        });
        self.memory.remember_user(&user).await?;
        log::info!("Logged in as {}", user.npub);
        Ok(user)
    }

    /// Save the open canvas, close it and forget the identity.
    ///
    /// A failed final save is logged; logout proceeds regardless.
    pub async fn logout(&mut self) -> ClientResult<()> {
        if let Some(account) = self.account.as_mut() {
            if account.autosave.canvas_id().is_some() {
                if let Err(e) = account.autosave.save().await {
                    log::warn!("Checkpoint before logout failed: {}", e);
                }
            }
        }
        self.close_canvas();
        self.account = None;
        self.store.with(|store| store.clear());
        self.memory.forget_user().await?;
        log::info!("Logged out");
        Ok(())
    }

    /// Start live sync for `canvas_id`, replacing the open canvas.
    ///
    /// The store starts empty; call [`restore_latest`](Self::restore_latest)
    /// to seed it from a checkpoint.
    pub async fn open_canvas(&mut self, canvas_id: &str, canvas_name: &str) -> ClientResult<()> {
        self.close_canvas();
        let account = self.account.as_mut().ok_or(ClientError::NotLoggedIn)?;
        self.store.with(|store| store.clear());

        let session = CanvasSession::open(
            canvas_id,
            &self.pool,
            account.actions.clone(),
            account.presence.clone(),
            &self.config,
        )
        .await?;
        account
            .autosave
            .set_canvas(Some((canvas_id.to_string(), canvas_name.to_string())));
        let sweeper = self.overlay.spawn_sweeper(self.config.overlay_sweep_interval());
        self.canvas = Some(OpenCanvas { session, sweeper });

        let pubkey = account.signer.public_key();
        if let Err(e) = self.memory.remember_last_canvas(&pubkey, canvas_id).await {
            log::warn!("Could not remember last canvas: {}", e);
        }
        Ok(())
    }

    /// Stop live sync. Safe to call with nothing open.
    pub fn close_canvas(&mut self) {
        if let Some(mut open) = self.canvas.take() {
            open.session.close();
            open.sweeper.stop();
        }
        if let Some(account) = self.account.as_mut() {
            account.autosave.set_canvas(None);
        }
    }

    /// Reopen the canvas this identity last worked on, restoring its newest
    /// checkpoint. Returns the canvas id, if there was one.
    pub async fn resume_last_canvas(&mut self) -> ClientResult<Option<String>> {
        let pubkey = self.public_key().ok_or(ClientError::NotLoggedIn)?;
        let Some(canvas_id) = self.memory.last_canvas(&pubkey).await? else {
            return Ok(None);
        };
        let name = match self.load_checkpoint(&canvas_id, None).await? {
            Some(checkpoint) => {
                let name = checkpoint.canvas_name.clone();
                self.open_canvas(&canvas_id, &name).await?;
                self.restore(&checkpoint)?;
                name
            }
            None => {
                self.open_canvas(&canvas_id, &canvas_id).await?;
                canvas_id.clone()
            }
        };
        log::info!("Resumed canvas {} ({})", canvas_id, name);
        Ok(Some(canvas_id))
    }

    fn live(&mut self) -> ClientResult<(&mut Account, String)> {
        let canvas_id = self
            .canvas
            .as_ref()
            .map(|open| open.session.canvas_id().to_string())
            .ok_or(ClientError::NoCanvas)?;
        let account = self.account.as_mut().ok_or(ClientError::NotLoggedIn)?;
        Ok((account, canvas_id))
    }

    /// Add an element locally, record an undo point, then broadcast it.
    pub async fn add_element(&mut self, element: CanvasElement) -> ClientResult<PublishReport> {
        let store = self.store.clone();
        let (account, canvas_id) = self.live()?;
        store.with(|store| {
            store.add(element.clone());
            store.snapshot_for_undo();
        });
        account.autosave.mark_dirty();
        Ok(account.actions.publish(Action::Add, &element, &canvas_id).await?)
    }

    /// Merge `patch` into an element and broadcast the result.
    ///
    /// Returns `None`, publishing nothing, if the id is unknown.
    pub async fn update_element(
        &mut self,
        id: &str,
        patch: impl Into<ElementPatch>,
    ) -> ClientResult<Option<PublishReport>> {
        let store = self.store.clone();
        let (account, canvas_id) = self.live()?;
        let updated = store.with(|store| {
            if !store.update(id, patch) {
                return None;
            }
            store.snapshot_for_undo();
            store.get(id).cloned()
        });
        let Some(element) = updated else {
            return Ok(None);
        };
        account.autosave.mark_dirty();
        Ok(Some(account.actions.publish(Action::Update, &element, &canvas_id).await?))
    }

    /// Tombstone elements and broadcast one delete per element.
    ///
    /// Returns how many elements were deleted. Every delete is sent even if
    /// an earlier one reached no relay; the first failure is returned after
    /// all were attempted.
    pub async fn delete_elements<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> ClientResult<usize> {
        let store = self.store.clone();
        let (account, canvas_id) = self.live()?;
        let deleted: Vec<CanvasElement> = store.with(|store| {
            let mut deleted = Vec::new();
            for id in ids {
                if store.soft_delete(id) {
                    deleted.extend(store.get(id).cloned());
                }
            }
            if !deleted.is_empty() {
                store.snapshot_for_undo();
            }
            deleted
        });
        if deleted.is_empty() {
            return Ok(0);
        }
        account.autosave.mark_dirty();
        let mut failure = None;
        for element in &deleted {
            if let Err(e) = account.actions.publish(Action::Delete, element, &canvas_id).await {
                log::warn!("Delete of {} was not broadcast: {}", element.id, e);
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(deleted.len()),
        }
    }

    /// Broadcast the local cursor, throttled. Returns whether it was sent.
    pub async fn broadcast_cursor(&self, x: f64, y: f64) -> bool {
        let (Some(account), Some(open)) = (self.account.as_ref(), self.canvas.as_ref()) else {
            return false;
        };
        account
            .presence
            .broadcast_position(x, y, open.session.canvas_id())
            .await
    }

    /// Show a short-lived element (a laser stroke, say) on the overlay.
    /// Returns its expiry in epoch milliseconds.
    pub fn add_overlay_element(&self, element: CanvasElement) -> i64 {
        self.overlay.add(element, now_millis(), self.config.overlay_ttl())
    }

    /// Show a short-lived element locally and also send it to peers as an
    /// `add` action. Peers receive it as an ordinary element.
    ///
    /// Returns its local expiry in epoch milliseconds.
    pub async fn share_overlay_element(&mut self, element: CanvasElement) -> ClientResult<i64> {
        let ttl = self.config.overlay_ttl();
        let overlay = self.overlay.clone();
        let (account, canvas_id) = self.live()?;
        let expires_at = overlay.add(element.clone(), now_millis(), ttl);
        account.actions.publish(Action::Add, &element, &canvas_id).await?;
        Ok(expires_at)
    }

    /// Publish a checkpoint of the open canvas now.
    pub async fn save_checkpoint(&mut self) -> ClientResult<PublishReport> {
        let (account, _) = self.live()?;
        account.autosave.save().await?.ok_or(ClientError::NoCanvas)
    }

    /// Publish a checkpoint if the canvas changed and the interval elapsed.
    pub async fn autosave_tick(&mut self) -> ClientResult<bool> {
        match self.account.as_mut() {
            Some(account) => Ok(account.autosave.maybe_save().await?),
            None => Ok(false),
        }
    }

    /// Newest checkpoint of `canvas_id`, by `author` or by the logged-in identity.
    pub async fn load_checkpoint(
        &self,
        canvas_id: &str,
        author: Option<&str>,
    ) -> ClientResult<Option<CanvasCheckpoint>> {
        let account = self.account.as_ref().ok_or(ClientError::NotLoggedIn)?;
        Ok(account.snapshots.load(canvas_id, author).await?)
    }

    /// Newest checkpoint per canvas of an identity, newest first.
    pub async fn list_checkpoints(&self, identity: &str) -> ClientResult<Vec<CheckpointSummary>> {
        let account = self.account.as_ref().ok_or(ClientError::NotLoggedIn)?;
        Ok(account.snapshots.list_for_identity(identity).await?)
    }

    /// Replace the store's contents with a checkpoint.
    pub fn restore(&self, checkpoint: &CanvasCheckpoint) -> ClientResult<usize> {
        let account = self.account.as_ref().ok_or(ClientError::NotLoggedIn)?;
        Ok(account.snapshots.restore(checkpoint))
    }

    /// Open the newest checkpoint of `canvas_id` and restore it.
    pub async fn restore_latest(&mut self, canvas_id: &str, author: Option<&str>) -> ClientResult<Option<usize>> {
        let Some(checkpoint) = self.load_checkpoint(canvas_id, author).await? else {
            return Ok(None);
        };
        if self.canvas_id() != Some(canvas_id) {
            self.open_canvas(canvas_id, &checkpoint.canvas_name).await?;
        }
        self.restore(&checkpoint).map(Some)
    }
}

impl Drop for DrawClient {
    fn drop(&mut self) {
        self.close_canvas();
    }
}
