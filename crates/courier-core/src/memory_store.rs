//! In-process [`SecretStore`] with the same collection rules as the daemon.
//!
//! Useful when embedding the core without a secret daemon, and as the
//! backing store for tests. Failure modes can be switched on to exercise
//! the key manager's degradation paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use zeroize::Zeroizing;

use crate::error::SecretError;
use crate::secret_client::{CollectionStatus, SecretStore};
use crate::secret_protocol::SecretHandle;

const ERROR_SECRET_EXISTS: i32 = 29;
const ERROR_INVALID_COLLECTION: i32 = 30;
const ERROR_WRITE_REJECTED: i32 = 50;

#[derive(Default)]
struct MemoryState {
    collections: HashSet<String>,
    foreign: HashSet<String>,
    secrets: HashMap<(String, String), Zeroizing<Vec<u8>>>,
    fail_writes: bool,
    unreachable: bool,
    create_collection_calls: usize,
}

#[derive(Default)]
pub struct MemorySecretStore {
    inner: Mutex<MemoryState>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `collection` was created by another application.
    pub fn mark_foreign(&self, collection: &str) {
        self.inner.lock().foreign.insert(collection.to_string());
    }

    /// Reject every `set_secret` until switched off.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Answer every call with `Unavailable` until switched off.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    /// Place raw bytes under `handle`, creating its collection if needed.
    pub fn insert_raw(&self, handle: &SecretHandle, data: &[u8]) {
        let mut state = self.inner.lock();
        state.collections.insert(handle.collection_name.clone());
        state
            .secrets
            .insert(key_of(handle), Zeroizing::new(data.to_vec()));
    }

    pub fn secret(&self, handle: &SecretHandle) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .secrets
            .get(&key_of(handle))
            .map(|bytes| bytes.to_vec())
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.inner.lock().collections.contains(name)
    }

    pub fn create_collection_calls(&self) -> usize {
        self.inner.lock().create_collection_calls
    }

    fn reachable(state: &MemoryState) -> Result<(), SecretError> {
        if state.unreachable {
            Err(SecretError::Unavailable)
        } else {
            Ok(())
        }
    }
}

fn key_of(handle: &SecretHandle) -> (String, String) {
    (
        handle.collection_name.clone(),
        handle.secret_name.clone(),
    )
}

fn rejected(operation: &'static str, error_code: i32, message: &str) -> SecretError {
    SecretError::Remote {
        operation,
        code: 1,
        error_code,
        message: message.to_string(),
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn create_collection(
        &self,
        handle: &SecretHandle,
    ) -> Result<CollectionStatus, SecretError> {
        let mut state = self.inner.lock();
        Self::reachable(&state)?;
        state.create_collection_calls += 1;
        if state.foreign.contains(&handle.collection_name) {
            return Err(SecretError::CollectionConflict);
        }
        if state.collections.insert(handle.collection_name.clone()) {
            Ok(CollectionStatus::Created)
        } else {
            Ok(CollectionStatus::AlreadyExists)
        }
    }

    async fn set_secret(&self, handle: &SecretHandle, data: &[u8]) -> Result<(), SecretError> {
        let mut state = self.inner.lock();
        Self::reachable(&state)?;
        if state.fail_writes {
            return Err(rejected("setSecret", ERROR_WRITE_REJECTED, "write rejected"));
        }
        if !state.collections.contains(&handle.collection_name) {
            return Err(rejected(
                "setSecret",
                ERROR_INVALID_COLLECTION,
                "no such collection",
            ));
        }
        let key = key_of(handle);
        if state.secrets.contains_key(&key) {
            return Err(rejected(
                "setSecret",
                ERROR_SECRET_EXISTS,
                "secret already exists",
            ));
        }
        state.secrets.insert(key, Zeroizing::new(data.to_vec()));
        Ok(())
    }

    async fn get_secret(&self, handle: &SecretHandle) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        let state = self.inner.lock();
        Self::reachable(&state)?;
        state
            .secrets
            .get(&key_of(handle))
            .cloned()
            .ok_or(SecretError::NotFound)
    }

    async fn delete_secret(&self, handle: &SecretHandle) -> Result<(), SecretError> {
        let mut state = self.inner.lock();
        Self::reachable(&state)?;
        state
            .secrets
            .remove(&key_of(handle))
            .map(|_| ())
            .ok_or(SecretError::NotFound)
    }

    async fn delete_collection(&self, handle: &SecretHandle) -> Result<(), SecretError> {
        let mut state = self.inner.lock();
        Self::reachable(&state)?;
        state.collections.remove(&handle.collection_name);
        state
            .secrets
            .retain(|(collection, _), _| collection != &handle.collection_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overwriting_requires_delete_first() {
        let store = MemorySecretStore::new();
        let handle = SecretHandle::new("k", "c", "p");
        store.create_collection(&handle).await.unwrap();
        store.set_secret(&handle, b"one").await.unwrap();
        assert!(store.set_secret(&handle, b"two").await.is_err());
        store.delete_secret(&handle).await.unwrap();
        store.set_secret(&handle, b"two").await.unwrap();
        assert_eq!(store.secret(&handle).unwrap(), b"two");
    }

    #[tokio::test]
    async fn deleting_collection_drops_its_secrets() {
        let store = MemorySecretStore::new();
        let handle = SecretHandle::new("k", "c", "p");
        store.insert_raw(&handle, b"raw");
        store.delete_collection(&handle).await.unwrap();
        assert!(store.secret(&handle).is_none());
        assert!(!store.has_collection("c"));
    }
}
