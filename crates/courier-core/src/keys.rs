//! Key lifecycle: fetch-or-generate at startup, rotate on logout, erase on wipe.
//!
//! The key itself lives only in memory. It is replaced wholesale on rotation;
//! readers clone the `Arc` at the start of an operation and never hold it
//! across a suspension point.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::envelope::EncryptionKey;
use crate::error::SecretError;
use crate::secret_client::{CollectionStatus, SecretStore};
use crate::secret_protocol::SecretHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Uninitialized,
    /// The secret service could not be reached; the session runs memory-only.
    Unavailable,
    KeyMissing,
    KeyReady,
}

pub struct KeyManager {
    store: Option<Arc<dyn SecretStore>>,
    handle: SecretHandle,
    collection_verified: AtomicBool,
    key: RwLock<Option<Arc<EncryptionKey>>>,
    state: RwLock<KeyState>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl KeyManager {
    /// `store` is `None` when discovery failed; every key operation then
    /// reports [`SecretError::Unavailable`].
    pub fn new(store: Option<Arc<dyn SecretStore>>, handle: SecretHandle) -> Self {
        Self {
            store,
            handle,
            collection_verified: AtomicBool::new(false),
            key: RwLock::new(None),
            state: RwLock::new(KeyState::Uninitialized),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.store.is_some()
    }

    pub fn state(&self) -> KeyState {
        *self.state.read()
    }

    pub fn handle(&self) -> &SecretHandle {
        &self.handle
    }

    pub fn current_key(&self) -> Option<Arc<EncryptionKey>> {
        self.key.read().clone()
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.current_key().map(|key| key.fingerprint())
    }

    fn store(&self) -> Result<&Arc<dyn SecretStore>, SecretError> {
        match &self.store {
            Some(store) => Ok(store),
            None => {
                *self.state.write() = KeyState::Unavailable;
                Err(SecretError::Unavailable)
            }
        }
    }

    fn adopt(&self, key: Arc<EncryptionKey>) {
        *self.key.write() = Some(key);
        *self.state.write() = KeyState::KeyReady;
    }

    /// Load the stored key, or generate and store a new one.
    ///
    /// An unreachable service does not trigger regeneration: a fresh key
    /// would orphan everything sealed under the one still held remotely.
    pub async fn get_or_create_key(&self) -> Result<Arc<EncryptionKey>, SecretError> {
        let _guard = self.lifecycle.lock().await;
        let store = self.store()?;

        match store.get_secret(&self.handle).await {
            Ok(bytes) => match EncryptionKey::from_slice(&bytes) {
                Some(key) => {
                    let key = Arc::new(key);
                    info!(fingerprint = %key.fingerprint(), "loaded encryption key from secret service");
                    self.adopt(key.clone());
                    return Ok(key);
                }
                None => warn!(
                    len = bytes.len(),
                    "stored encryption key has wrong length; replacing it"
                ),
            },
            Err(err) if err.is_unreachable() => {
                warn!("secret service did not answer key lookup: {err}");
                return Err(err);
            }
            Err(SecretError::NotFound) => debug!("no stored encryption key"),
            Err(err) => warn!("retrieving encryption key failed: {err}"),
        }

        *self.state.write() = KeyState::KeyMissing;
        let key = self.generate_and_store(store).await?;
        info!(fingerprint = %key.fingerprint(), "generated and stored new encryption key");
        self.adopt(key.clone());
        Ok(key)
    }

    /// Delete the remote secret and collection, then generate, store and
    /// adopt a fresh key.
    pub async fn rotate(&self) -> Result<Arc<EncryptionKey>, SecretError> {
        let _guard = self.lifecycle.lock().await;
        let store = self.store()?;

        if let Err(err) = store.delete_secret(&self.handle).await {
            debug!("delete secret before rotation: {err}");
        }
        if let Err(err) = store.delete_collection(&self.handle).await {
            debug!("delete collection before rotation: {err}");
        }
        self.collection_verified.store(false, Ordering::SeqCst);

        let key = self.generate_and_store(store).await?;
        let previous = self.fingerprint();
        self.adopt(key.clone());
        info!(
            previous = previous.as_deref().unwrap_or("none"),
            fingerprint = %key.fingerprint(),
            "rotated encryption key"
        );
        Ok(key)
    }

    /// Best-effort removal of the remote secret and collection, then forget
    /// the in-memory key. Never fails.
    pub async fn clear_all(&self) {
        let _guard = self.lifecycle.lock().await;
        if let Some(store) = &self.store {
            if let Err(err) = store.delete_secret(&self.handle).await {
                debug!("clear_all: delete secret: {err}");
            }
            if let Err(err) = store.delete_collection(&self.handle).await {
                debug!("clear_all: delete collection: {err}");
            }
        }
        self.collection_verified.store(false, Ordering::SeqCst);
        *self.key.write() = None;
        *self.state.write() = KeyState::Uninitialized;
        info!("cleared encryption key and remote secrets");
    }

    async fn generate_and_store(
        &self,
        store: &Arc<dyn SecretStore>,
    ) -> Result<Arc<EncryptionKey>, SecretError> {
        let key = EncryptionKey::generate();
        self.store_secret(store, key.as_bytes()).await?;
        Ok(Arc::new(key))
    }

    /// Delete-then-write so a leftover secret never makes `set_secret` fail.
    async fn store_secret(
        &self,
        store: &Arc<dyn SecretStore>,
        data: &[u8],
    ) -> Result<(), SecretError> {
        self.ensure_collection(store).await?;
        let _ = store.delete_secret(&self.handle).await;
        if let Err(err) = store.set_secret(&self.handle, data).await {
            self.collection_verified.store(false, Ordering::SeqCst);
            return Err(err);
        }
        debug!(secret = %self.handle.secret_name, "stored secret");
        Ok(())
    }

    async fn ensure_collection(&self, store: &Arc<dyn SecretStore>) -> Result<(), SecretError> {
        if self.collection_verified.load(Ordering::SeqCst) {
            return Ok(());
        }
        match store.create_collection(&self.handle).await {
            Ok(CollectionStatus::Created) => {
                info!(collection = %self.handle.collection_name, "created secret collection")
            }
            Ok(CollectionStatus::AlreadyExists) => {
                debug!(collection = %self.handle.collection_name, "secret collection already exists")
            }
            Err(SecretError::CollectionConflict) => {
                warn!(
                    collection = %self.handle.collection_name,
                    "secret collection is owned by a different application"
                );
                return Err(SecretError::CollectionConflict);
            }
            Err(err) if err.is_unreachable() => return Err(err),
            // The collection may exist already; a failing write will reset the flag.
            Err(err) => warn!("createCollection failed: {err}"),
        }
        self.collection_verified.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemorySecretStore;

    fn manager() -> (Arc<MemorySecretStore>, KeyManager) {
        let store = Arc::new(MemorySecretStore::new());
        let handle = SecretHandle::new("encryption-key", "courier", "plugin");
        let manager = KeyManager::new(Some(store.clone() as Arc<dyn SecretStore>), handle);
        (store, manager)
    }

    #[tokio::test]
    async fn generated_key_is_stored_and_reloaded() {
        let (store, manager) = manager();
        assert_eq!(manager.state(), KeyState::Uninitialized);
        let first = manager.get_or_create_key().await.unwrap();
        assert_eq!(manager.state(), KeyState::KeyReady);
        assert_eq!(
            store.secret(manager.handle()).unwrap(),
            first.as_bytes().to_vec()
        );

        let reopened = KeyManager::new(
            Some(store.clone() as Arc<dyn SecretStore>),
            manager.handle().clone(),
        );
        let second = reopened.get_or_create_key().await.unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[tokio::test]
    async fn wrong_length_secret_is_replaced() {
        let (store, manager) = manager();
        store.insert_raw(manager.handle(), &[1u8; 16]);
        let key = manager.get_or_create_key().await.unwrap();
        assert_eq!(store.secret(manager.handle()).unwrap().len(), 32);
        assert_eq!(store.secret(manager.handle()).unwrap(), key.as_bytes().to_vec());
    }

    #[tokio::test]
    async fn missing_service_means_unavailable() {
        let handle = SecretHandle::new("encryption-key", "courier", "plugin");
        let manager = KeyManager::new(None, handle);
        let err = manager.get_or_create_key().await.unwrap_err();
        assert!(matches!(err, SecretError::Unavailable));
        assert_eq!(manager.state(), KeyState::Unavailable);
        assert!(manager.current_key().is_none());
    }

    #[tokio::test]
    async fn unreachable_lookup_does_not_regenerate() {
        let (store, manager) = manager();
        store.insert_raw(manager.handle(), &[4u8; 32]);
        store.set_unreachable(true);
        assert!(manager.get_or_create_key().await.is_err());
        store.set_unreachable(false);
        assert_eq!(store.secret(manager.handle()).unwrap(), vec![4u8; 32]);
    }

    #[tokio::test]
    async fn rotate_replaces_key() {
        let (store, manager) = manager();
        let old = manager.get_or_create_key().await.unwrap();
        let new = manager.rotate().await.unwrap();
        assert_ne!(old.as_bytes(), new.as_bytes());
        assert_eq!(manager.current_key().unwrap().as_bytes(), new.as_bytes());
        assert_eq!(store.secret(manager.handle()).unwrap(), new.as_bytes().to_vec());
    }

    #[tokio::test]
    async fn clear_all_forgets_everything() {
        let (store, manager) = manager();
        manager.get_or_create_key().await.unwrap();
        manager.clear_all().await;
        assert!(manager.current_key().is_none());
        assert_eq!(manager.state(), KeyState::Uninitialized);
        assert!(store.secret(manager.handle()).is_none());
        assert!(!store.has_collection("courier"));
    }

    #[tokio::test]
    async fn clear_all_survives_unreachable_service() {
        let (store, manager) = manager();
        manager.get_or_create_key().await.unwrap();
        store.set_unreachable(true);
        manager.clear_all().await;
        assert!(manager.current_key().is_none());
    }

    #[tokio::test]
    async fn failed_write_forces_collection_recheck() {
        let (store, manager) = manager();
        manager.get_or_create_key().await.unwrap();
        assert_eq!(store.create_collection_calls(), 1);

        store.fail_writes(true);
        assert!(manager.rotate().await.is_err());
        store.fail_writes(false);

        manager.rotate().await.unwrap();
        // rotate deletes the collection, so each attempt re-verifies it
        assert_eq!(store.create_collection_calls(), 3);
        assert!(store.has_collection("courier"));
    }

    #[tokio::test]
    async fn foreign_collection_is_surfaced() {
        let (store, manager) = manager();
        store.mark_foreign("courier");
        let err = manager.get_or_create_key().await.unwrap_err();
        assert!(matches!(err, SecretError::CollectionConflict));
        assert!(manager.current_key().is_none());
    }
}
