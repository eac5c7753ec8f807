//! Maps protocol events onto cache mutations.

use courier_core::{MediaInfo, Message};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::protocol::{HistoryConversation, InboundMessage, ProtocolEvent};

pub fn spawn_ingest(
    backend: Arc<Backend>,
    mut events: mpsc::Receiver<ProtocolEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            handle_event(&backend, event).await;
        }
        debug!("protocol event stream closed");
    })
}

pub async fn handle_event(backend: &Arc<Backend>, event: ProtocolEvent) {
    match event {
        ProtocolEvent::Message(message) => ingest_message(backend, message).await,
        ProtocolEvent::HistorySync(conversations) => ingest_history(backend, conversations),
        ProtocolEvent::Connected => {
            backend.set_connected(true);
            info!("connected");
            let backend = backend.clone();
            tokio::spawn(async move {
                tokio::time::sleep(backend.timings().contact_reload_delay).await;
                if let Err(e) = backend.reload_contacts().await {
                    warn!("contact reload failed: {e}");
                }
            });
        }
        ProtocolEvent::PairSuccess { id } => {
            backend.set_connected(true);
            info!(id = %id, "paired");
        }
        ProtocolEvent::LoggedOut => {
            backend.set_connected(false);
            warn!("logged out by server");
        }
    }
}

async fn ingest_message(backend: &Backend, inbound: InboundMessage) {
    let sender_id = if inbound.from_me {
        backend.client().own_id().unwrap_or(inbound.sender_id)
    } else {
        inbound.sender_id
    };

    if !inbound.from_me {
        if let Some(name) = inbound.push_name.as_deref().filter(|n| !n.is_empty()) {
            backend.core().cache().upsert_contact(sender_id.clone(), name);
        }
    }

    let mut text = inbound.text.unwrap_or_default();
    let media = match &inbound.media {
        Some(media) => {
            if let Some(caption) = media.caption.as_deref().filter(|c| !c.is_empty()) {
                text = caption.to_string();
            }
            let local_path = backend.download_media(&inbound.id, media).await;
            Some(MediaInfo {
                kind: media.kind,
                mime_type: Some(media.mime_type.clone()).filter(|m| !m.is_empty()),
                file_name: media.file_name.clone(),
                file_size: media.file_size,
                local_path,
            })
        }
        None => None,
    };

    if text.is_empty() && media.is_none() {
        return;
    }
    let message = Message {
        id: inbound.id,
        sender_id,
        chat_id: inbound.chat_id,
        text,
        timestamp: inbound.timestamp,
        from_me: inbound.from_me,
        media,
    };
    let chat = message.chat_id.clone();
    if backend.insert_message(message) {
        debug!(chat = %chat, "message stored");
    }
}

fn ingest_history(backend: &Backend, conversations: Vec<HistoryConversation>) {
    let cache = backend.core().cache();
    let mut names = Vec::new();
    let mut messages = Vec::new();
    for conversation in conversations {
        let chat_id = match conversation.id.split_once('@') {
            Some((user, _)) if !user.is_empty() => user.to_string(),
            _ => conversation.id.clone(),
        };
        if let Some(name) = conversation.name.filter(|n| !n.is_empty()) {
            names.push((chat_id.clone(), name));
        }
        for entry in conversation.messages {
            let Some(text) = entry.text.filter(|t| !t.is_empty()) else {
                continue;
            };
            let mut message = Message::text(entry.id, &chat_id, &chat_id, text, entry.timestamp);
            message.from_me = entry.from_me;
            messages.push(message);
        }
    }
    let added = cache.insert_messages(messages);
    cache.upsert_contacts(names);
    info!(added, "history sync applied");
}
