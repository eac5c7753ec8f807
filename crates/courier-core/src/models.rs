use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Identifiers longer than this are group ids rather than phone-number user ids.
pub const USER_ID_MAX_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
    Sticker,
}

impl MediaKind {
    /// Kind used for an outgoing upload of the given MIME type.
    pub fn for_upload(mime_type: &str) -> Self {
        if mime_type.starts_with("image/") {
            MediaKind::Image
        } else if mime_type.starts_with("video/") {
            MediaKind::Video
        } else if mime_type.starts_with("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Document
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
            MediaKind::Sticker => "sticker",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    #[serde(rename = "mediaType")]
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    /// Where the downloaded file was written, if the download succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl MediaInfo {
    pub fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            mime_type: None,
            file_name: None,
            file_size: None,
            local_path: None,
        }
    }
}

/// A stored message. The media fields sit flat beside the others on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "sender")]
    pub sender_id: String,
    #[serde(default, rename = "chatJid")]
    pub chat_id: String,
    #[serde(default)]
    pub text: String,
    /// Seconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub from_me: bool,
    #[serde(flatten)]
    pub media: Option<MediaInfo>,
}

impl Message {
    pub fn text(
        id: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        text: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            text: text.into(),
            timestamp,
            from_me: false,
            media: None,
        }
    }

    pub fn with_media(mut self, media: MediaInfo) -> Self {
        self.media = Some(media);
        self
    }

    pub fn sent_by_me(mut self) -> Self {
        self.from_me = true;
        self
    }

    /// The conversation this message belongs to; the sender when no chat id was recorded.
    pub fn conversation_id(&self) -> &str {
        if self.chat_id.is_empty() {
            &self.sender_id
        } else {
            &self.chat_id
        }
    }

    /// Text shown in a chat list: the body, or `[kind]` for a media-only message.
    pub fn summary_text(&self) -> String {
        match (&self.media, self.text.is_empty()) {
            (Some(media), true) => format!("[{}]", media.kind),
            _ => self.text.clone(),
        }
    }
}

/// Derived per-conversation summary. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(rename = "jid")]
    pub id: String,
    pub name: String,
    pub last_message: String,
    pub last_time: i64,
    pub from_me: bool,
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<PathBuf>,
}

pub fn is_group_id(id: &str) -> bool {
    id.len() > USER_ID_MAX_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_message_json_parses() {
        let raw = r#"[
            {"id":"A1","sender":"5551234","text":"hi","timestamp":100,"fromMe":false,"chatJid":"5551234"},
            {"id":"A2","sender":"5551234","text":"","timestamp":101,"fromMe":false,"chatJid":"",
             "mediaType":"image","mimeType":"image/jpeg","fileSize":2048,"localPath":"/tmp/a.jpg"}
        ]"#;
        let messages: Vec<Message> = serde_json::from_str(raw).unwrap();
        assert!(messages[0].media.is_none());
        let media = messages[1].media.as_ref().unwrap();
        assert_eq!(media.kind, MediaKind::Image);
        assert_eq!(media.file_size, Some(2048));
        assert_eq!(messages[1].conversation_id(), "5551234");
        assert_eq!(messages[1].summary_text(), "[image]");
    }

    #[test]
    fn text_message_omits_media_fields() {
        let message = Message::text("m1", "1", "1", "hello", 5);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["chatJid"], "1");
        assert_eq!(json["fromMe"], false);
        assert!(json.get("mediaType").is_none());
        assert!(json.get("localPath").is_none());
    }

    #[test]
    fn upload_kind_follows_mime_prefix() {
        assert_eq!(MediaKind::for_upload("video/mp4"), MediaKind::Video);
        assert_eq!(MediaKind::for_upload("application/zip"), MediaKind::Document);
        assert!(is_group_id("120363012345678901"));
        assert!(!is_group_id("5551234"));
    }
}
