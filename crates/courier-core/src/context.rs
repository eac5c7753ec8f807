//! The session: one key manager, one state store and one cache, set up
//! together at startup and torn down together on identity reset.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::cache::{Cache, CollectionCounts, FlushMode};
use crate::config::{CourierConfig, SecretServiceConfig};
use crate::envelope::{EncryptionKey, EnvelopeCodec};
use crate::error::SecretError;
use crate::keys::{KeyManager, KeyState};
use crate::secret_client::{SecretServiceClient, SecretStore};
use crate::state_store::StateStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreStatus {
    pub data_dir: PathBuf,
    pub secret_service: bool,
    pub key_state: String,
    pub key_fingerprint: Option<String>,
    pub encrypted: bool,
    pub counts: CollectionCounts,
}

pub struct CoreContext {
    config: CourierConfig,
    data_dir: PathBuf,
    keys: Arc<KeyManager>,
    store: StateStore,
    cache: Cache,
}

/// Discover the secret daemon. `None` if it cannot be reached; the caller
/// then runs without persistence encryption.
pub async fn connect_secret_service(config: &SecretServiceConfig) -> Option<Arc<dyn SecretStore>> {
    match SecretServiceClient::discover(config).await {
        Ok(client) => Some(Arc::new(client)),
        Err(e) => {
            warn!("secret service unavailable: {e}");
            None
        }
    }
}

impl CoreContext {
    pub async fn init(config: CourierConfig) -> anyhow::Result<Self> {
        let secrets = connect_secret_service(&config.secrets).await;
        Self::with_secret_store(config, secrets).await
    }

    /// Build the session around an already chosen secret store.
    pub async fn with_secret_store(
        config: CourierConfig,
        secrets: Option<Arc<dyn SecretStore>>,
    ) -> anyhow::Result<Self> {
        let data_dir = config.data_dir()?;
        let keys = Arc::new(KeyManager::new(secrets, config.secrets.handle()));
        match keys.get_or_create_key().await {
            Ok(key) => info!(fingerprint = %key.fingerprint(), "state encryption enabled"),
            Err(e) => warn!(
                "no encryption key ({e}); state is kept in memory only and will not be saved"
            ),
        }

        let store = StateStore::open(&data_dir, EnvelopeCodec::new(keys.clone()))?;
        let mode = match (config.persistence.background_flush, Handle::try_current()) {
            (true, Ok(handle)) => FlushMode::Background(handle),
            _ => FlushMode::Inline,
        };
        let cache = Cache::open(store.clone(), mode);

        Ok(Self {
            config,
            data_dir,
            keys,
            store,
            cache,
        })
    }

    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub async fn rotate(&self) -> Result<Arc<EncryptionKey>, SecretError> {
        self.keys.rotate().await
    }

    /// Forget the current identity: wipe cached state and its files, erase
    /// the remote secret, and start over with a fresh key. Never fails;
    /// every step is attempted and problems are logged.
    pub async fn reset_identity(&self) {
        let cache = self.cache.clone();
        match tokio::task::spawn_blocking(move || cache.wipe()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("wiping local state: {e}"),
            Err(e) => warn!("wipe task failed: {e}"),
        }

        self.keys.clear_all().await;

        match self.keys.rotate().await {
            Ok(key) => info!(fingerprint = %key.fingerprint(), "identity reset with fresh key"),
            Err(e) => warn!("identity reset without a key ({e}); state stays in memory"),
        }
    }

    /// Write every collection now. Called once on shutdown.
    pub fn flush(&self) {
        if let Err(e) = self.cache.flush_all() {
            if e.is_no_key() {
                info!("shutdown: state not saved, no encryption key");
            } else {
                warn!("shutdown flush failed: {e}");
            }
        }
    }

    pub fn status(&self) -> CoreStatus {
        let key_state = self.keys.state();
        CoreStatus {
            data_dir: self.data_dir.clone(),
            secret_service: self.keys.is_available(),
            key_state: format!("{key_state:?}"),
            key_fingerprint: self.keys.fingerprint(),
            encrypted: key_state == KeyState::KeyReady,
            counts: self.cache.counts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemorySecretStore;
    use crate::models::Message;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> CourierConfig {
        let mut config = CourierConfig::default();
        config.data_dir = Some(dir.to_path_buf());
        config.persistence.background_flush = false;
        config
    }

    #[tokio::test]
    async fn reset_identity_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let secrets = Arc::new(MemorySecretStore::new());
        let ctx = CoreContext::with_secret_store(
            config_in(dir.path()),
            Some(secrets.clone() as Arc<dyn SecretStore>),
        )
        .await
        .unwrap();
        let before = ctx.keys().fingerprint().unwrap();
        ctx.cache().insert_message(Message::text("1", "A", "A", "hi", 1));
        ctx.cache().upsert_contact("A", "Alice");
        assert!(ctx.store().encrypted_path("messages").exists());

        ctx.reset_identity().await;

        let status = ctx.status();
        assert_eq!(status.counts, CollectionCounts::default());
        assert!(status.encrypted);
        assert_ne!(status.key_fingerprint.unwrap(), before);
        assert!(!ctx.store().encrypted_path("messages").exists());
        assert!(!ctx.store().encrypted_path("contacts").exists());
        let stored = secrets.secret(ctx.keys().handle()).unwrap();
        assert_eq!(stored, ctx.keys().current_key().unwrap().as_bytes().to_vec());
    }

    #[tokio::test]
    async fn state_survives_restart_with_same_secret_store() {
        let dir = tempdir().unwrap();
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        {
            let ctx = CoreContext::with_secret_store(config_in(dir.path()), Some(secrets.clone()))
                .await
                .unwrap();
            ctx.cache().upsert_contact("5551234", "Alice");
            ctx.flush();
        }
        let ctx = CoreContext::with_secret_store(config_in(dir.path()), Some(secrets))
            .await
            .unwrap();
        assert_eq!(ctx.cache().contact_name("5551234").as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn without_secret_service_nothing_is_written() {
        let dir = tempdir().unwrap();
        let ctx = CoreContext::with_secret_store(config_in(dir.path()), None)
            .await
            .unwrap();
        ctx.cache().insert_message(Message::text("1", "A", "A", "hi", 1));
        ctx.flush();
        let status = ctx.status();
        assert!(!status.secret_service);
        assert!(!status.encrypted);
        assert_eq!(status.counts.messages, 1);
        assert!(!ctx.store().encrypted_path("messages").exists());

        ctx.reset_identity().await;
        assert_eq!(ctx.cache().counts().messages, 0);
    }
}
