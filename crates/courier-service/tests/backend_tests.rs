use async_trait::async_trait;
use courier_core::paths::MediaPaths;
use courier_core::secret_client::SecretStore;
use courier_core::{CoreContext, CourierConfig, MediaKind, MemorySecretStore};
use courier_service::control::{self, ControlRequest, ControlResponse};
use courier_service::ingest::handle_event;
use courier_service::protocol::{
    ContactInfo, GroupInfo, HistoryConversation, HistoryMessage, InboundMedia, InboundMessage,
    MediaRef, SentMessage,
};
use courier_service::{Backend, MessagingClient, ProtocolError, ProtocolEvent, Timings};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const OWN_ID: &str = "15550001111";

#[derive(Default)]
struct FakeClient {
    connected: AtomicBool,
    sent: AtomicUsize,
    logged_out: AtomicBool,
    reconnects: AtomicUsize,
    contacts: Mutex<Vec<ContactInfo>>,
    groups: Mutex<Vec<GroupInfo>>,
    uploads: Mutex<Vec<(String, MediaKind, String)>>,
}

impl FakeClient {
    fn online() -> Arc<Self> {
        let client = Self::default();
        client.connected.store(true, Ordering::SeqCst);
        Arc::new(client)
    }
}

#[async_trait]
impl MessagingClient for FakeClient {
    fn own_id(&self) -> Option<String> {
        Some(OWN_ID.to_string())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_text(&self, _to: &str, _text: &str) -> Result<SentMessage, ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let n = self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(SentMessage {
            id: format!("OUT{n}"),
        })
    }

    async fn send_media(
        &self,
        to: &str,
        _data: Vec<u8>,
        kind: MediaKind,
        mime_type: &str,
        _file_name: &str,
        _caption: &str,
    ) -> Result<SentMessage, ProtocolError> {
        self.uploads
            .lock()
            .push((to.to_string(), kind, mime_type.to_string()));
        let n = self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(SentMessage {
            id: format!("OUT{n}"),
        })
    }

    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, ProtocolError> {
        Ok(media.0.as_bytes().to_vec())
    }

    async fn profile_picture_url(&self, _id: &str) -> Result<Option<String>, ProtocolError> {
        Ok(None)
    }

    async fn contacts(&self) -> Result<Vec<ContactInfo>, ProtocolError> {
        Ok(self.contacts.lock().clone())
    }

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, ProtocolError> {
        Ok(self.groups.lock().clone())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        self.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), ProtocolError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    root: std::path::PathBuf,
    client: Arc<FakeClient>,
    backend: Arc<Backend>,
}

async fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mut config = CourierConfig::default();
    config.data_dir = Some(root.join("state"));
    config.persistence.background_flush = false;

    let secrets = Arc::new(MemorySecretStore::new());
    let core = CoreContext::with_secret_store(config, Some(secrets as Arc<dyn SecretStore>))
        .await
        .unwrap();
    let client = FakeClient::online();
    let backend = Backend::new(
        core,
        client.clone() as Arc<dyn MessagingClient>,
        MediaPaths::under(&root.join("media")),
    )
    .unwrap()
    .with_timings(Timings {
        contact_reload_delay: Duration::ZERO,
        avatar_prefetch_interval: Duration::ZERO,
    });
    Harness {
        _dir: dir,
        root,
        client,
        backend: Arc::new(backend),
    }
}

fn inbound(id: &str, sender: &str, text: &str, timestamp: i64) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        chat_id: sender.to_string(),
        sender_id: sender.to_string(),
        from_me: false,
        push_name: None,
        timestamp,
        text: Some(text.to_string()),
        media: None,
    }
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
}

#[tokio::test]
async fn send_text_stores_outgoing_message() {
    let h = harness().await;
    let sent = h.backend.send_text("15550002222", "hello").await.unwrap();
    assert_eq!(sent.id, "OUT0");
    assert!(sent.from_me);
    assert_eq!(sent.sender_id, OWN_ID);

    let chats = h.backend.get_chats();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].id, "15550002222");
    assert_eq!(chats[0].last_message, "hello");
    assert!(chats[0].from_me);
}

#[tokio::test]
async fn send_text_while_offline_stores_nothing() {
    let h = harness().await;
    h.client.connected.store(false, Ordering::SeqCst);
    let err = h.backend.send_text("15550002222", "hello").await.unwrap_err();
    assert!(matches!(err, ProtocolError::NotConnected));
    assert!(h.backend.get_messages(None).is_empty());
}

#[tokio::test]
async fn send_media_detects_kind_from_extension() {
    let h = harness().await;
    let file = h.root.join("clip.mp4");
    std::fs::write(&file, b"not really a video").unwrap();

    let sent = h
        .backend
        .send_media("15550002222", &file, "watch this")
        .await
        .unwrap();
    assert_eq!(sent.text, "watch this");
    let media = sent.media.unwrap();
    assert_eq!(media.kind, MediaKind::Video);
    assert_eq!(media.file_size, Some(18));

    let uploads = h.client.uploads.lock().clone();
    assert_eq!(
        uploads,
        vec![("15550002222".to_string(), MediaKind::Video, "video/mp4".to_string())]
    );
}

#[tokio::test]
async fn captioned_image_is_downloaded_into_pictures() {
    let h = harness().await;
    let mut message = inbound("M1", "15550002222", "", 100);
    message.text = None;
    message.media = Some(InboundMedia {
        kind: MediaKind::Image,
        mime_type: "image/jpeg".into(),
        file_name: None,
        file_size: Some(5),
        caption: Some("sunset".into()),
        reference: MediaRef("bytes".into()),
    });
    handle_event(&h.backend, ProtocolEvent::Message(message)).await;

    let stored = h.backend.get_messages(Some("15550002222"));
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].text, "sunset");
    let path = stored[0]
        .media
        .as_ref()
        .and_then(|m| m.local_path.clone())
        .unwrap();
    assert!(path.starts_with(&h.backend.media().pictures));
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("M1_") && name.ends_with(".jpg"), "{name}");
    assert_eq!(std::fs::read(&path).unwrap(), b"bytes");
}

#[tokio::test]
async fn push_name_becomes_contact_name() {
    let h = harness().await;
    let mut message = inbound("M1", "15550002222", "hi", 100);
    message.push_name = Some("Bob".into());
    handle_event(&h.backend, ProtocolEvent::Message(message)).await;

    assert_eq!(
        h.backend.get_contacts().get("15550002222").map(String::as_str),
        Some("Bob")
    );
    assert_eq!(h.backend.get_chats()[0].name, "Bob");
}

#[tokio::test]
async fn own_messages_use_own_id_and_skip_contact_update() {
    let h = harness().await;
    let mut message = inbound("M1", "someone-else", "mine", 100);
    message.chat_id = "15550002222".into();
    message.from_me = true;
    message.push_name = Some("Me".into());
    handle_event(&h.backend, ProtocolEvent::Message(message)).await;

    let stored = h.backend.get_messages(None);
    assert_eq!(stored[0].sender_id, OWN_ID);
    assert!(stored[0].from_me);
    assert!(h.backend.get_contacts().is_empty());
}

#[tokio::test]
async fn duplicate_and_empty_events_are_ignored() {
    let h = harness().await;
    handle_event(
        &h.backend,
        ProtocolEvent::Message(inbound("M1", "15550002222", "first", 100)),
    )
    .await;
    handle_event(
        &h.backend,
        ProtocolEvent::Message(inbound("M1", "15550002222", "changed", 200)),
    )
    .await;
    handle_event(
        &h.backend,
        ProtocolEvent::Message(inbound("M2", "15550002222", "", 300)),
    )
    .await;

    let stored = h.backend.get_messages(None);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].text, "first");
}

#[tokio::test]
async fn history_sync_strips_server_and_keeps_text_only() {
    let h = harness().await;
    let conversations = vec![HistoryConversation {
        id: "15550003333@s.example.net".into(),
        name: Some("Carol".into()),
        messages: vec![
            HistoryMessage {
                id: "H1".into(),
                text: Some("old news".into()),
                timestamp: 10,
                from_me: false,
            },
            HistoryMessage {
                id: "H2".into(),
                text: None,
                timestamp: 20,
                from_me: false,
            },
            HistoryMessage {
                id: "H3".into(),
                text: Some("reply".into()),
                timestamp: 30,
                from_me: true,
            },
        ],
    }];
    handle_event(&h.backend, ProtocolEvent::HistorySync(conversations)).await;

    let stored = h.backend.get_messages(Some("15550003333"));
    let ids: Vec<_> = stored.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["H1", "H3"]);
    assert!(stored.iter().all(|m| m.chat_id == "15550003333"));

    let chats = h.backend.get_chats();
    assert_eq!(chats[0].name, "Carol");
    assert_eq!(chats[0].last_message, "reply");
}

#[tokio::test]
async fn connected_event_reloads_contacts_and_groups() {
    let h = harness().await;
    h.backend.set_connected(false);
    *h.client.contacts.lock() = vec![
        ContactInfo {
            id: "15550002222".into(),
            full_name: Some("Bob Builder".into()),
            push_name: Some("Bob".into()),
        },
        ContactInfo {
            id: "15550004444".into(),
            full_name: None,
            push_name: Some("Dee".into()),
        },
        ContactInfo {
            id: "15550005555".into(),
            full_name: None,
            push_name: None,
        },
    ];
    *h.client.groups.lock() = vec![GroupInfo {
        id: "120363000000000001".into(),
        name: "Climbing".into(),
    }];

    handle_event(&h.backend, ProtocolEvent::Connected).await;
    assert!(h.backend.is_connected());

    let mut contacts = h.backend.get_contacts();
    for _ in 0..100 {
        if contacts.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        contacts = h.backend.get_contacts();
    }
    assert_eq!(contacts.len(), 3);
    assert_eq!(contacts["15550002222"], "Bob Builder");
    assert_eq!(contacts["15550004444"], "Dee");
    assert_eq!(contacts["120363000000000001"], "Climbing");
}

#[tokio::test]
async fn cached_avatar_is_served_without_network() {
    let h = harness().await;
    let path = h.backend.media().avatars.join("15550002222.jpg");
    std::fs::write(&path, b"jpeg").unwrap();
    h.backend
        .core()
        .cache()
        .upsert_avatar_path("15550002222", &path);

    h.client.connected.store(false, Ordering::SeqCst);
    assert_eq!(h.backend.get_avatar("15550002222").await, Some(path));
    assert_eq!(h.backend.get_avatar("15550009999").await, None);
}

#[tokio::test]
async fn logout_wipes_state_and_rotates_key() {
    let h = harness().await;
    handle_event(
        &h.backend,
        ProtocolEvent::Message(inbound("M1", "15550002222", "hi", 100)),
    )
    .await;
    h.backend.core().cache().upsert_contact("15550002222", "Bob");
    let avatar = h.backend.media().avatars.join("15550002222.jpg");
    std::fs::write(&avatar, b"jpeg").unwrap();
    let before = h.backend.core().keys().fingerprint().unwrap();
    assert!(h.backend.core().store().encrypted_path("messages").exists());

    h.backend.logout().await;

    assert!(h.client.logged_out.load(Ordering::SeqCst));
    assert_eq!(h.client.reconnects.load(Ordering::SeqCst), 1);
    assert!(!h.backend.is_connected());
    assert!(h.backend.get_messages(None).is_empty());
    assert!(h.backend.get_contacts().is_empty());
    assert!(!h.backend.core().store().encrypted_path("messages").exists());
    assert!(is_empty_dir(&h.backend.media().avatars));
    let after = h.backend.core().keys().fingerprint().unwrap();
    assert_ne!(before, after);
}

#[tokio::test]
async fn rotate_key_keeps_state_readable() {
    let h = harness().await;
    h.backend.send_text("15550002222", "before rotation").await.unwrap();
    let before = h.backend.core().keys().fingerprint().unwrap();

    let after = h.backend.rotate_key().await.unwrap();
    assert_ne!(before, after);

    let reloaded = h
        .backend
        .core()
        .store()
        .load::<Vec<courier_core::Message>>("messages")
        .unwrap();
    assert_eq!(reloaded.value.len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn control_socket_round_trip() {
    let h = harness().await;
    let socket = h.root.join("control.sock");
    let server = control::spawn_control_server(h.backend.clone(), socket.clone()).unwrap();

    let response = control::request(
        &socket,
        &ControlRequest::SendText {
            to: "15550002222".into(),
            text: "over the socket".into(),
        },
    )
    .await
    .unwrap();
    assert!(matches!(response, ControlResponse::Sent(ref m) if m.text == "over the socket"));

    match control::request(&socket, &ControlRequest::Status).await.unwrap() {
        ControlResponse::Status(status) => {
            assert!(status.core.encrypted);
            assert_eq!(status.own_id.as_deref(), Some(OWN_ID));
            assert_eq!(status.core.counts.messages, 1);
        }
        other => panic!("unexpected response {other:?}"),
    }

    h.client.connected.store(false, Ordering::SeqCst);
    let response = control::request(
        &socket,
        &ControlRequest::SendText {
            to: "15550002222".into(),
            text: "offline".into(),
        },
    )
    .await
    .unwrap();
    assert!(matches!(response, ControlResponse::Error { .. }));
    server.abort();
}
