//! Encrypted local state for the courier messaging daemon.
//!
//! # Key handling
//! A single 256-bit key protects everything written to disk. It lives in an
//! external secret daemon and is fetched over a short-lived connection per
//! call (`secret_client`), generated on first run and rotated on logout
//! (`keys`). When the daemon cannot be reached the session keeps its state
//! in memory only.
//!
//! # Persistence
//! Each collection is serialized to JSON, sealed with XChaCha20-Poly1305
//! (`envelope`) and written atomically (`state_store`). Plaintext files from
//! older installs are migrated on first load.
//!
//! # Cache
//! `cache` holds messages, contacts and avatar paths behind independent
//! locks and flushes full snapshots in the background; `chats` derives the
//! conversation list from it.

pub mod cache;
pub mod chats;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod memory_store;
pub mod models;
pub mod paths;
pub mod secret_client;
pub mod secret_protocol;
pub mod state_store;

pub use cache::{Cache, CollectionKind, FlushMode};
pub use config::CourierConfig;
pub use context::{CoreContext, CoreStatus};
pub use envelope::{EncryptionKey, EnvelopeCodec};
pub use error::{EnvelopeError, SecretError, StoreError};
pub use keys::{KeyManager, KeyState};
pub use memory_store::MemorySecretStore;
pub use models::{Chat, MediaInfo, MediaKind, Message};
pub use secret_client::{SecretServiceClient, SecretStore};
pub use state_store::StateStore;
