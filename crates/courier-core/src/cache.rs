//! In-memory collections with fire-and-forget full-snapshot persistence.
//!
//! Messages, contacts and avatars each sit behind their own lock. No method
//! holds more than one collection lock at a time, and no lock is held across
//! disk I/O: a mutation updates memory, releases the lock, then schedules a
//! flush that snapshots the collection afresh.
//!
//! Flushes pass through a gate. [`Cache::wipe`] and [`Cache::reseal`] close
//! it exclusively and bump an epoch, so a flush scheduled before them can
//! neither race the file deletion nor land a file sealed under a retired key.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::chats::{self, ChatDirectory};
use crate::error::StoreError;
use crate::models::{Chat, Message};
use crate::state_store::{LoadOrigin, StateStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Messages,
    Contacts,
    Avatars,
}

impl CollectionKind {
    pub const ALL: [CollectionKind; 3] = [
        CollectionKind::Messages,
        CollectionKind::Contacts,
        CollectionKind::Avatars,
    ];

    /// File stem under the state directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            CollectionKind::Messages => "messages",
            CollectionKind::Contacts => "contacts",
            CollectionKind::Avatars => "avatars",
        }
    }
}

/// How scheduled flushes run.
#[derive(Clone)]
pub enum FlushMode {
    /// Detached blocking task on the given runtime.
    Background(Handle),
    /// On the calling thread before the mutation returns.
    Inline,
}

/// Identifier-keyed map with last-write-wins upserts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyValueCollection<V> {
    entries: HashMap<String, V>,
}

impl<V: Clone> KeyValueCollection<V> {
    pub fn upsert(&mut self, id: impl Into<String>, value: V) -> Option<V> {
        self.entries.insert(id.into(), value)
    }

    pub fn get(&self, id: &str) -> Option<&V> {
        self.entries.get(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn snapshot(&self) -> HashMap<String, V> {
        self.entries.clone()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionCounts {
    pub messages: usize,
    pub contacts: usize,
    pub avatars: usize,
}

struct CacheInner {
    messages: RwLock<Vec<Message>>,
    contacts: RwLock<KeyValueCollection<String>>,
    avatars: RwLock<KeyValueCollection<PathBuf>>,
    store: StateStore,
    mode: FlushMode,
    gate: RwLock<()>,
    epoch: AtomicU64,
}

#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    /// Load all three collections from `store`. A collection that fails to
    /// load starts empty.
    pub fn open(store: StateStore, mode: FlushMode) -> Self {
        let messages: Vec<Message> = load_or_default(&store, CollectionKind::Messages);
        let contacts: KeyValueCollection<String> = load_or_default(&store, CollectionKind::Contacts);
        let avatars: KeyValueCollection<PathBuf> = load_or_default(&store, CollectionKind::Avatars);
        info!(
            messages = messages.len(),
            contacts = contacts.len(),
            avatars = avatars.len(),
            "cache loaded"
        );
        Self {
            inner: Arc::new(CacheInner {
                messages: RwLock::new(messages),
                contacts: RwLock::new(contacts),
                avatars: RwLock::new(avatars),
                store,
                mode,
                gate: RwLock::new(()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Append `message` unless one with the same id is already stored.
    /// Returns whether it was added.
    pub fn insert_message(&self, message: Message) -> bool {
        {
            let mut messages = self.inner.messages.write();
            if messages.iter().any(|m| m.id == message.id) {
                return false;
            }
            messages.push(message);
        }
        self.schedule_flush(CollectionKind::Messages);
        true
    }

    /// Append every message whose id is not stored yet, then flush once.
    /// Returns how many were added.
    pub fn insert_messages<I>(&self, batch: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let added = {
            let mut messages = self.inner.messages.write();
            let mut known: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
            let before = messages.len();
            for message in batch {
                if known.insert(message.id.clone()) {
                    messages.push(message);
                }
            }
            messages.len() - before
        };
        if added > 0 {
            self.schedule_flush(CollectionKind::Messages);
        }
        added
    }

    pub fn upsert_contact(&self, id: impl Into<String>, name: impl Into<String>) {
        self.inner.contacts.write().upsert(id, name.into());
        self.schedule_flush(CollectionKind::Contacts);
    }

    /// Upsert many contacts under one lock acquisition and one flush.
    pub fn upsert_contacts<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let count = {
            let mut contacts = self.inner.contacts.write();
            let mut count = 0;
            for (id, name) in entries {
                contacts.upsert(id, name);
                count += 1;
            }
            count
        };
        if count > 0 {
            self.schedule_flush(CollectionKind::Contacts);
        }
        count
    }

    pub fn upsert_avatar_path(&self, id: impl Into<String>, path: impl Into<PathBuf>) {
        self.inner.avatars.write().upsert(id, path.into());
        self.schedule_flush(CollectionKind::Avatars);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.read().clone()
    }

    pub fn messages_for_chat(&self, id: &str) -> Vec<Message> {
        chats::messages_for_chat(&self.inner.messages.read(), id)
    }

    pub fn contact_name(&self, id: &str) -> Option<String> {
        self.inner.contacts.read().get(id).cloned()
    }

    pub fn contacts(&self) -> HashMap<String, String> {
        self.inner.contacts.read().snapshot()
    }

    /// The cached avatar path, unless the file has since disappeared.
    pub fn avatar_path(&self, id: &str) -> Option<PathBuf> {
        let path = self.inner.avatars.read().get(id).cloned()?;
        if path.is_file() {
            Some(path)
        } else {
            debug!(id, path = %path.display(), "cached avatar file is gone");
            None
        }
    }

    pub fn chats(&self) -> Vec<Chat> {
        let snapshot = self.messages();
        chats::aggregate(&snapshot, self)
    }

    pub fn counts(&self) -> CollectionCounts {
        let messages = self.inner.messages.read().len();
        let contacts = self.inner.contacts.read().len();
        let avatars = self.inner.avatars.read().len();
        CollectionCounts {
            messages,
            contacts,
            avatars,
        }
    }

    /// Synchronously write all three collections. Used at shutdown.
    pub fn flush_all(&self) -> Result<(), StoreError> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let mut first_error = None;
        for kind in CollectionKind::ALL {
            if let Err(e) = self.inner.flush(kind, epoch) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Rewrite every collection under the key now held. Call after a key
    /// swap: flushes already past the gate finish first, flushes scheduled
    /// earlier are dropped, then everything is saved again.
    pub fn reseal(&self) -> Result<(), StoreError> {
        {
            let _gate = self.inner.gate.write();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.flush_all()
    }

    /// Clear every collection and delete its files. Waits for in-flight
    /// flushes; flushes scheduled before this call are dropped.
    pub fn wipe(&self) -> Result<(), StoreError> {
        let _gate = self.inner.gate.write();
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.messages.write().clear();
        self.inner.contacts.write().clear();
        self.inner.avatars.write().clear();

        let mut first_error = None;
        for kind in CollectionKind::ALL {
            if let Err(e) = self.inner.store.remove(kind.file_name()) {
                warn!(collection = kind.file_name(), "removing state file failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        info!("cache wiped");
        first_error.map_or(Ok(()), Err)
    }

    fn schedule_flush(&self, kind: CollectionKind) {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        match &self.inner.mode {
            FlushMode::Background(handle) => {
                let inner = self.inner.clone();
                handle.spawn_blocking(move || inner.flush_logged(kind, epoch));
            }
            FlushMode::Inline => self.inner.flush_logged(kind, epoch),
        }
    }
}

impl ChatDirectory for Cache {
    fn contact_name(&self, id: &str) -> Option<String> {
        Cache::contact_name(self, id)
    }

    fn avatar_path(&self, id: &str) -> Option<PathBuf> {
        Cache::avatar_path(self, id)
    }
}

impl CacheInner {
    fn flush_logged(&self, kind: CollectionKind, epoch: u64) {
        match self.flush(kind, epoch) {
            Ok(()) => {}
            Err(e) if e.is_no_key() => {
                debug!(collection = kind.file_name(), "not persisted: no encryption key")
            }
            Err(e) => warn!(collection = kind.file_name(), "saving collection failed: {e}"),
        }
    }

    fn flush(&self, kind: CollectionKind, epoch: u64) -> Result<(), StoreError> {
        let _gate = self.gate.read();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!(collection = kind.file_name(), "dropping flush scheduled before wipe");
            return Ok(());
        }
        let name = kind.file_name();
        match kind {
            CollectionKind::Messages => {
                let snapshot = self.messages.read().clone();
                self.store.save(name, &snapshot)
            }
            CollectionKind::Contacts => {
                let snapshot = self.contacts.read().clone();
                self.store.save(name, &snapshot)
            }
            CollectionKind::Avatars => {
                let snapshot = self.avatars.read().clone();
                self.store.save(name, &snapshot)
            }
        }
    }
}

fn load_or_default<T>(store: &StateStore, kind: CollectionKind) -> T
where
    T: Serialize + for<'de> Deserialize<'de> + Default,
{
    let name = kind.file_name();
    match store.load::<T>(name) {
        Ok(loaded) => {
            match loaded.origin {
                LoadOrigin::Encrypted => debug!(collection = name, "loaded encrypted collection"),
                LoadOrigin::Migrated => info!(collection = name, "migrated legacy collection"),
                LoadOrigin::MigrationPending => {
                    warn!(collection = name, "legacy collection loaded but left unencrypted on disk")
                }
                LoadOrigin::Fresh => debug!(collection = name, "no stored collection"),
            }
            loaded.value
        }
        Err(e) => {
            warn!(collection = name, "loading collection failed, starting empty: {e}");
            T::default()
        }
    }
}
