use anyhow::{Context, Result};
use chrono::Utc;
use courier_core::paths::MediaPaths;
use courier_core::{Chat, CoreContext, CoreStatus, MediaInfo, MediaKind, Message};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::avatars::AvatarFetcher;
use crate::media;
use crate::protocol::{InboundMedia, MessagingClient, ProtocolError};

/// Pause between a `Connected` event and the contact reload it triggers.
pub const CONTACT_RELOAD_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub connected: bool,
    pub own_id: Option<String>,
    #[serde(flatten)]
    pub core: CoreStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub contact_reload_delay: Duration,
    pub avatar_prefetch_interval: Duration,
}

/// Everything the front end may ask of the daemon.
pub struct Backend {
    core: CoreContext,
    client: Arc<dyn MessagingClient>,
    media: MediaPaths,
    avatars: AvatarFetcher,
    connected: AtomicBool,
    timings: Timings,
}

impl Backend {
    pub fn new(core: CoreContext, client: Arc<dyn MessagingClient>, media: MediaPaths) -> Result<Self> {
        media.ensure().context("create media folders")?;
        let media_config = &core.config().media;
        let avatars = AvatarFetcher::new(
            media.avatars.clone(),
            Duration::from_secs(media_config.avatar_fetch_timeout_secs),
        )?;
        let timings = Timings {
            contact_reload_delay: CONTACT_RELOAD_DELAY,
            avatar_prefetch_interval: Duration::from_millis(media_config.avatar_prefetch_interval_ms),
        };
        Ok(Self {
            core,
            client,
            media,
            avatars,
            connected: AtomicBool::new(false),
            timings,
        })
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn core(&self) -> &CoreContext {
        &self.core
    }

    pub fn client(&self) -> &Arc<dyn MessagingClient> {
        &self.client
    }

    pub fn media(&self) -> &MediaPaths {
        &self.media
    }

    pub fn timings(&self) -> Timings {
        self.timings
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            connected: self.is_connected(),
            own_id: self.client.own_id(),
            core: self.core.status(),
        }
    }

    pub fn get_chats(&self) -> Vec<Chat> {
        self.core.cache().chats()
    }

    /// All messages, or only those of one conversation (oldest first).
    pub fn get_messages(&self, chat_id: Option<&str>) -> Vec<Message> {
        match chat_id.filter(|id| !id.is_empty()) {
            Some(id) => self.core.cache().messages_for_chat(id),
            None => self.core.cache().messages(),
        }
    }

    pub fn get_contacts(&self) -> HashMap<String, String> {
        self.core.cache().contacts()
    }

    pub fn insert_message(&self, message: Message) -> bool {
        self.core.cache().insert_message(message)
    }

    /// Cached avatar, or a fresh download when connected.
    pub async fn get_avatar(&self, id: &str) -> Option<PathBuf> {
        if let Some(path) = self.core.cache().avatar_path(id) {
            return Some(path);
        }
        if !self.client.is_connected() {
            return None;
        }
        let url = match self.client.profile_picture_url(id).await {
            Ok(Some(url)) => url,
            Ok(None) => return None,
            Err(e) => {
                debug!(id, "no profile picture: {e}");
                return None;
            }
        };
        match self.avatars.fetch(id, &url).await {
            Ok(path) => {
                self.core.cache().upsert_avatar_path(id, &path);
                Some(path)
            }
            Err(e) => {
                debug!(id, "avatar download failed: {e}");
                None
            }
        }
    }

    pub async fn send_text(&self, to: &str, text: &str) -> Result<Message, ProtocolError> {
        let sent = self.client.send_text(to, text).await?;
        let message = Message::text(sent.id, self.own_id(), to, text, Utc::now().timestamp())
            .sent_by_me();
        self.insert_message(message.clone());
        info!(to, "sent text message");
        Ok(message)
    }

    pub async fn send_media(&self, to: &str, path: &Path, caption: &str) -> Result<Message> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = media::mime_for(path);
        let kind = MediaKind::for_upload(mime_type);
        let size = data.len() as u64;

        let sent = self
            .client
            .send_media(to, data, kind, mime_type, &file_name, caption)
            .await?;

        let message = Message::text(sent.id, self.own_id(), to, caption, Utc::now().timestamp())
            .sent_by_me()
            .with_media(MediaInfo {
                kind,
                mime_type: Some(mime_type.to_string()),
                file_name: Some(file_name.clone()),
                file_size: Some(size),
                local_path: Some(path.to_path_buf()),
            });
        self.insert_message(message.clone());
        info!(to, file = %file_name, "sent media message");
        Ok(message)
    }

    /// Fetch contacts and group names from the client, store them in one
    /// batch, then prefetch missing avatars in the background.
    pub async fn reload_contacts(self: &Arc<Self>) -> Result<usize, ProtocolError> {
        let mut entries: Vec<(String, String)> = self
            .client
            .contacts()
            .await?
            .into_iter()
            .filter_map(|c| c.display_name().map(|name| (c.id.clone(), name.to_string())))
            .collect();
        match self.client.joined_groups().await {
            Ok(groups) => entries.extend(groups.into_iter().map(|g| (g.id, g.name))),
            Err(e) => warn!("loading joined groups failed: {e}"),
        }
        let ids: Vec<String> = entries.iter().map(|(id, _)| id.clone()).collect();
        let count = self.core.cache().upsert_contacts(entries);
        info!(count, "contacts reloaded");

        let backend = self.clone();
        tokio::spawn(async move { backend.prefetch_avatars(ids).await });
        Ok(count)
    }

    async fn prefetch_avatars(&self, ids: Vec<String>) {
        let mut fetched = 0usize;
        for id in ids {
            if !self.client.is_connected() {
                break;
            }
            if self.core.cache().avatar_path(&id).is_some() {
                continue;
            }
            if self.get_avatar(&id).await.is_some() {
                fetched += 1;
            }
            tokio::time::sleep(self.timings.avatar_prefetch_interval).await;
        }
        debug!(fetched, "avatar prefetch finished");
    }

    /// Download an inbound attachment into the media folder for its type.
    pub async fn download_media(&self, message_id: &str, media: &InboundMedia) -> Option<PathBuf> {
        let data = match self.client.download_media(&media.reference).await {
            Ok(data) => data,
            Err(e) => {
                warn!(message_id, "media download failed: {e}");
                return None;
            }
        };
        let path = media::download_path(
            &self.media,
            message_id,
            &media.mime_type,
            media.file_name.as_deref(),
        );
        let write = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &data).await
        };
        match write.await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(path = %path.display(), "saving media failed: {e}");
                None
            }
        }
    }

    /// Re-key the state files. Every collection is rewritten under the new key.
    pub async fn rotate_key(&self) -> Result<String> {
        let key = self.core.rotate().await?;
        let cache = self.core.cache().clone();
        tokio::task::spawn_blocking(move || cache.reseal())
            .await?
            .context("rewrite state under new key")?;
        info!(fingerprint = %key.fingerprint(), "state re-encrypted");
        Ok(key.fingerprint())
    }

    /// Sign out and forget everything. Always succeeds locally.
    pub async fn logout(&self) {
        info!("logging out");
        self.client.disconnect().await;
        if self.client.own_id().is_some() {
            if let Err(e) = self.client.logout().await {
                warn!("remote logout failed: {e}");
            }
        }
        self.set_connected(false);
        self.core.reset_identity().await;
        if let Err(e) = self.avatars.purge().await {
            warn!("purging avatars failed: {e}");
        }
        match self.client.reconnect().await {
            Ok(()) => info!("logged out; client restarted for new pairing"),
            Err(e) => warn!("logged out; client restart failed: {e}"),
        }
    }

    /// Flush all collections; called once before exit.
    pub fn shutdown(&self) {
        self.core.flush();
        info!("state flushed");
    }

    fn own_id(&self) -> String {
        self.client.own_id().unwrap_or_default()
    }
}
