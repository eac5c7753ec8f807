//! Seam to the messaging protocol library.
//!
//! The library owns pairing, the wire protocol and its own end-to-end
//! encryption. The daemon only consumes its parsed events and asks it to
//! send, download and look things up.

use async_trait::async_trait;
use courier_core::MediaKind;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("not connected to the messaging service")]
    NotConnected,
    #[error("device is not paired")]
    NotPaired,
    #[error("remote rejected {operation}: {message}")]
    Remote {
        operation: &'static str,
        message: String,
    },
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server acknowledgement for an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
}

/// Opaque download reference for a media attachment, interpreted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRef(pub String);

#[derive(Debug, Clone)]
pub struct InboundMedia {
    pub kind: MediaKind,
    pub mime_type: String,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub caption: Option<String>,
    pub reference: MediaRef,
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub from_me: bool,
    pub push_name: Option<String>,
    pub timestamp: i64,
    pub text: Option<String>,
    pub media: Option<InboundMedia>,
}

#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub id: String,
    pub text: Option<String>,
    pub timestamp: i64,
    pub from_me: bool,
}

#[derive(Debug, Clone)]
pub struct HistoryConversation {
    /// Conversation id, possibly with a `@server` suffix.
    pub id: String,
    pub name: Option<String>,
    pub messages: Vec<HistoryMessage>,
}

#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    Message(InboundMessage),
    HistorySync(Vec<HistoryConversation>),
    Connected,
    PairSuccess { id: String },
    LoggedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    pub id: String,
    pub full_name: Option<String>,
    pub push_name: Option<String>,
}

impl ContactInfo {
    /// Full name when known, otherwise the push name.
    pub fn display_name(&self) -> Option<&str> {
        self.full_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or_else(|| self.push_name.as_deref().filter(|name| !name.is_empty()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Our own user id once paired.
    fn own_id(&self) -> Option<String>;
    fn is_connected(&self) -> bool;

    /// Hand over the inbound event stream. Yields `Some` at most once.
    fn take_events(&self) -> Option<mpsc::Receiver<ProtocolEvent>> {
        None
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<SentMessage, ProtocolError>;
    async fn send_media(
        &self,
        to: &str,
        data: Vec<u8>,
        kind: MediaKind,
        mime_type: &str,
        file_name: &str,
        caption: &str,
    ) -> Result<SentMessage, ProtocolError>;
    async fn download_media(&self, media: &MediaRef) -> Result<Vec<u8>, ProtocolError>;
    async fn profile_picture_url(&self, id: &str) -> Result<Option<String>, ProtocolError>;
    async fn contacts(&self) -> Result<Vec<ContactInfo>, ProtocolError>;
    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, ProtocolError>;
    async fn disconnect(&self);
    async fn logout(&self) -> Result<(), ProtocolError>;

    /// Start a fresh session after logout so a new device can pair.
    async fn reconnect(&self) -> Result<(), ProtocolError> {
        Err(ProtocolError::NotPaired)
    }
}

/// Client used when no protocol library is linked in. It never connects, so
/// the daemon serves its cached state read-only.
#[derive(Debug, Default)]
pub struct OfflineClient;

#[async_trait]
impl MessagingClient for OfflineClient {
    fn own_id(&self) -> Option<String> {
        None
    }

    fn is_connected(&self) -> bool {
        false
    }

    async fn send_text(&self, _to: &str, _text: &str) -> Result<SentMessage, ProtocolError> {
        Err(ProtocolError::NotConnected)
    }

    async fn send_media(
        &self,
        _to: &str,
        _data: Vec<u8>,
        _kind: MediaKind,
        _mime_type: &str,
        _file_name: &str,
        _caption: &str,
    ) -> Result<SentMessage, ProtocolError> {
        Err(ProtocolError::NotConnected)
    }

    async fn download_media(&self, _media: &MediaRef) -> Result<Vec<u8>, ProtocolError> {
        Err(ProtocolError::NotConnected)
    }

    async fn profile_picture_url(&self, _id: &str) -> Result<Option<String>, ProtocolError> {
        Err(ProtocolError::NotConnected)
    }

    async fn contacts(&self) -> Result<Vec<ContactInfo>, ProtocolError> {
        Err(ProtocolError::NotPaired)
    }

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, ProtocolError> {
        Err(ProtocolError::NotPaired)
    }

    async fn disconnect(&self) {}

    async fn logout(&self) -> Result<(), ProtocolError> {
        Err(ProtocolError::NotPaired)
    }
}
