use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::{self, MediaPaths};
use crate::secret_protocol::SecretHandle;

pub const DEFAULT_COLLECTION: &str = "courier";
pub const DEFAULT_SECRET_NAME: &str = "encryption-key";
pub const DEFAULT_PLUGIN: &str = "org.secrets.plugin.encryptedstorage";
pub const DEFAULT_CLIENT_ID: &str = "courier";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretServiceConfig {
    /// Overrides the well-known discovery socket.
    #[serde(default)]
    pub discovery_socket: Option<PathBuf>,
    pub collection: String,
    pub secret_name: String,
    pub plugin: String,
    pub client_id: String,
    pub discovery_timeout_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for SecretServiceConfig {
    fn default() -> Self {
        Self {
            discovery_socket: None,
            collection: DEFAULT_COLLECTION.into(),
            secret_name: DEFAULT_SECRET_NAME.into(),
            plugin: DEFAULT_PLUGIN.into(),
            client_id: DEFAULT_CLIENT_ID.into(),
            discovery_timeout_ms: 3_000,
            call_timeout_ms: 3_000,
        }
    }
}

impl SecretServiceConfig {
    pub fn handle(&self) -> SecretHandle {
        SecretHandle::new(&self.secret_name, &self.collection, &self.plugin)
    }

    pub fn discovery_socket(&self) -> PathBuf {
        self.discovery_socket
            .clone()
            .unwrap_or_else(paths::secrets_discovery_socket)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// When false, every mutation is flushed synchronously on the caller's thread.
    pub background_flush: bool,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            background_flush: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    #[serde(default)]
    pub root: Option<PathBuf>,
    pub avatar_fetch_timeout_secs: u64,
    pub avatar_prefetch_interval_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            root: None,
            avatar_fetch_timeout_secs: 10,
            avatar_prefetch_interval_ms: 100,
        }
    }
}

impl MediaConfig {
    pub fn paths(&self) -> anyhow::Result<MediaPaths> {
        match &self.root {
            Some(root) => Ok(MediaPaths::under(root)),
            None => MediaPaths::from_user_dirs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Where the encrypted collections live. Defaults to the platform data dir.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub secrets: SecretServiceConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

impl CourierConfig {
    /// Read `config.json` from `data_dir` if it exists; otherwise defaults.
    pub fn load(data_dir: &Path) -> anyhow::Result<Self> {
        let path = paths::config_path(data_dir);
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str::<CourierConfig>(&raw)
                .map_err(|e| anyhow::anyhow!("parse {}: {e}", path.display()))?
        } else {
            CourierConfig::default()
        };
        if config.data_dir.is_none() {
            config.data_dir = Some(data_dir.to_path_buf());
        }
        if let Ok(socket) = std::env::var("COURIER_SECRETS_DISCOVERY") {
            config.secrets.discovery_socket = Some(PathBuf::from(socket));
        }
        Ok(config)
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => paths::data_dir(),
        }
    }
}
