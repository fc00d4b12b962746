//! In-memory storage implementation.

use super::{Storage, StorageError, StorageResult};
use crate::BoxFuture;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory storage for testing and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(format!("Lock error: {}", e))
}

impl Storage for MemoryStorage {
    fn save(&self, key: &str, value: &str) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            self.values.write().map_err(lock_error)?.insert(key, value);
            Ok(())
        })
    }

    fn load(&self, key: &str) -> BoxFuture<'_, StorageResult<String>> {
        let key = key.to_string();
        Box::pin(async move {
            let values = self.values.read().map_err(lock_error)?;
            values.get(&key).cloned().ok_or(StorageError::NotFound(key))
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, StorageResult<()>> {
        let key = key.to_string();
        Box::pin(async move {
            self.values.write().map_err(lock_error)?.remove(&key);
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, StorageResult<Vec<String>>> {
        Box::pin(async move { Ok(self.values.read().map_err(lock_error)?.keys().cloned().collect()) })
    }

    fn exists(&self, key: &str) -> BoxFuture<'_, StorageResult<bool>> {
        let key = key.to_string();
        Box::pin(async move { Ok(self.values.read().map_err(lock_error)?.contains_key(&key)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load() {
        let storage = MemoryStorage::new();
        storage.save("k", "v1").await.unwrap();
        storage.save("k", "v2").await.unwrap();
        assert_eq!(storage.load("k").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_not_found() {
        let storage = MemoryStorage::new();
        assert!(matches!(storage.load("missing").await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let storage = MemoryStorage::new();
        storage.save("a", "1").await.unwrap();
        storage.save("b", "2").await.unwrap();
        storage.delete("a").await.unwrap();
        storage.delete("a").await.unwrap();

        assert!(!storage.exists("a").await.unwrap());
        assert_eq!(storage.list().await.unwrap(), vec!["b".to_string()]);
    }
}
