//! Named-collection persistence: serde_json → envelope → atomic file write.
//!
//! Each collection `name` lives in `<dir>/<name>.enc`. A plaintext
//! `<name>.json` from older installs is read once, re-saved encrypted, and
//! then removed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::envelope::EnvelopeCodec;
use crate::error::StoreError;

const ENCRYPTED_EXT: &str = "enc";
const LEGACY_EXT: &str = "json";
const STAGING_SUFFIX: &str = ".staging";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOrigin {
    Encrypted,
    /// Read from the legacy plaintext file, which has since been removed.
    Migrated,
    /// Read from the legacy plaintext file, which stays until an encrypted copy exists.
    MigrationPending,
    Fresh,
}

#[derive(Debug)]
pub struct Loaded<T> {
    pub value: T,
    pub origin: LoadOrigin,
}

#[derive(Clone)]
pub struct StateStore {
    dir: PathBuf,
    codec: EnvelopeCodec,
}

impl StateStore {
    pub fn open(dir: impl Into<PathBuf>, codec: EnvelopeCodec) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        restrict_dir_permissions(&dir);
        cleanup_staging(&dir);
        Ok(Self { dir, codec })
    }

    pub fn encrypted_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{ENCRYPTED_EXT}"))
    }

    pub fn legacy_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{LEGACY_EXT}"))
    }

    /// Serialize, seal and atomically replace `<name>.enc`. Any legacy
    /// plaintext copy is deleted once the encrypted one is on disk.
    pub fn save<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(value)?);
        let sealed = self.codec.seal(&plaintext)?;
        write_atomic(&self.dir, &self.encrypted_path(name), &sealed)?;
        debug!(collection = name, bytes = sealed.len(), "saved collection");
        self.remove_legacy(name);
        Ok(())
    }

    fn remove_legacy(&self, name: &str) {
        let legacy = self.legacy_path(name);
        match fs::remove_file(&legacy) {
            Ok(()) => info!(collection = name, "removed legacy plaintext file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %legacy.display(), "cannot remove legacy plaintext file: {e}"),
        }
    }

    pub fn load<T>(&self, name: &str) -> Result<Loaded<T>, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let encrypted = self.encrypted_path(name);
        match fs::read(&encrypted) {
            Ok(sealed) => {
                let plaintext = self.codec.open(&sealed)?;
                let value = serde_json::from_slice(&plaintext)?;
                return Ok(Loaded {
                    value,
                    origin: LoadOrigin::Encrypted,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.migrate(name)
    }

    fn migrate<T>(&self, name: &str) -> Result<Loaded<T>, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let legacy = self.legacy_path(name);
        let raw = match fs::read(&legacy) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Loaded {
                    value: T::default(),
                    origin: LoadOrigin::Fresh,
                })
            }
            Err(e) => {
                return Err(StoreError::MigrationFailure {
                    path: legacy,
                    reason: e.to_string(),
                })
            }
        };
        let value: T = serde_json::from_slice(&raw).map_err(|e| StoreError::MigrationFailure {
            path: legacy,
            reason: e.to_string(),
        })?;

        match self.save(name, &value) {
            Ok(()) => {
                info!(collection = name, "migrated legacy plaintext collection");
                Ok(Loaded {
                    value,
                    origin: LoadOrigin::Migrated,
                })
            }
            Err(e) => {
                if e.is_no_key() {
                    debug!(collection = name, "no key; legacy file kept until it can be encrypted");
                } else {
                    warn!(collection = name, "re-encrypting legacy collection failed: {e}");
                }
                Ok(Loaded {
                    value,
                    origin: LoadOrigin::MigrationPending,
                })
            }
        }
    }

    /// Delete both the encrypted file and any legacy remnant.
    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        for path in [self.encrypted_path(name), self.legacy_path(name)] {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed state file"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn write_atomic(dir: &Path, dest: &Path, bytes: &[u8]) -> io::Result<()> {
    let staging_path = dir.join(format!(".{}{STAGING_SUFFIX}", Uuid::new_v4()));
    {
        let mut file = create_private(&staging_path)?;
        if let Err(e) = file.write_all(bytes).and_then(|_| file.sync_all()) {
            let _ = fs::remove_file(&staging_path);
            return Err(e);
        }
    }
    if let Err(e) = fs::rename(&staging_path, dest) {
        let _ = fs::remove_file(&staging_path);
        return Err(e);
    }
    fsync_dir(dir)
}

fn create_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

fn fsync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn restrict_dir_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o700)) {
            warn!("cannot restrict permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

/// Remove staging files left behind by a crash mid-write.
fn cleanup_staging(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().ends_with(STAGING_SUFFIX) {
                warn!(path = %entry.path().display(), "removing orphaned staging file");
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}
