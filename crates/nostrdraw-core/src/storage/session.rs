//! Remembered login and last opened canvas.

use super::{Storage, StorageError, StorageResult};
use crate::identity::{IdentityError, Keys, npub_encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Key of the logged-in user record.
pub const USER_KEY: &str = "nostr_user";

/// Prefix of the per-identity last canvas key.
pub const LAST_CANVAS_PREFIX: &str = "lastCanvas:";

/// The identity a client was last logged in as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub pubkey: String,
    pub npub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl UserRecord {
    pub fn from_pubkey(pubkey: &str) -> Result<Self, IdentityError> {
        Ok(Self {
            pubkey: pubkey.to_string(),
            npub: npub_encode(pubkey)?,
            name: None,
        })
    }

    pub fn from_keys(keys: &Keys) -> Self {
        Self {
            pubkey: keys.public_key_hex(),
            npub: keys.npub(),
            name: None,
        }
    }
}

/// Session state kept across restarts.
#[derive(Clone)]
pub struct SessionMemory {
    storage: Arc<dyn Storage>,
}

impl SessionMemory {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub async fn remember_user(&self, user: &UserRecord) -> StorageResult<()> {
        let json = serde_json::to_string(user).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.storage.save(USER_KEY, &json).await
    }

    /// The remembered user, if any. A corrupt record counts as none.
    pub async fn user(&self) -> StorageResult<Option<UserRecord>> {
        match self.storage.load(USER_KEY).await {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(user) => Ok(Some(user)),
                Err(e) => {
                    log::warn!("Discarding unreadable session record: {}", e);
                    Ok(None)
                }
            },
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn forget_user(&self) -> StorageResult<()> {
        self.storage.delete(USER_KEY).await
    }

    pub async fn remember_last_canvas(&self, pubkey: &str, canvas_id: &str) -> StorageResult<()> {
        self.storage.save(&last_canvas_key(pubkey), canvas_id).await
    }

    pub async fn last_canvas(&self, pubkey: &str) -> StorageResult<Option<String>> {
        match self.storage.load(&last_canvas_key(pubkey)).await {
            Ok(canvas_id) => Ok(Some(canvas_id)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn last_canvas_key(pubkey: &str) -> String {
    format!("{}{}", LAST_CANVAS_PREFIX, pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn memory() -> (Arc<MemoryStorage>, SessionMemory) {
        let storage = Arc::new(MemoryStorage::new());
        (storage.clone(), SessionMemory::new(storage))
    }

    #[tokio::test]
    async fn test_user_round_trip() {
        let (_, session) = memory();
        assert_eq!(session.user().await.unwrap(), None);

        let keys = Keys::generate();
        let user = UserRecord::from_keys(&keys);
        session.remember_user(&user).await.unwrap();
        assert_eq!(session.user().await.unwrap(), Some(user));

        session.forget_user().await.unwrap();
        assert_eq!(session.user().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_corrupt_user_is_ignored() {
        let (storage, session) = memory();
        storage.save(USER_KEY, "not json").await.unwrap();
        assert_eq!(session.user().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_canvas_is_per_identity() {
        let (storage, session) = memory();
        session.remember_last_canvas("aa", "c1").await.unwrap();
        session.remember_last_canvas("bb", "c2").await.unwrap();

        assert_eq!(session.last_canvas("aa").await.unwrap().as_deref(), Some("c1"));
        assert_eq!(session.last_canvas("cc").await.unwrap(), None);
        assert!(storage.exists("lastCanvas:bb").await.unwrap());

        // Logging out keeps the per-identity canvas.
        session.forget_user().await.unwrap();
        assert_eq!(session.last_canvas("bb").await.unwrap().as_deref(), Some("c2"));
    }

    #[test]
    fn test_record_from_pubkey() {
        let keys = Keys::generate();
        let record = UserRecord::from_pubkey(&keys.public_key_hex()).unwrap();
        assert_eq!(record.npub, keys.npub());
        assert!(UserRecord::from_pubkey("nope").is_err());
    }
}
