use std::collections::HashMap;
use std::path::PathBuf;

use crate::models::{is_group_id, Chat, Message};

/// Name and avatar lookups used to decorate a chat summary.
pub trait ChatDirectory {
    fn contact_name(&self, id: &str) -> Option<String>;
    fn avatar_path(&self, id: &str) -> Option<PathBuf>;
}

/// One summary per conversation, newest first.
///
/// Within a conversation the message with the greatest timestamp wins; on
/// equal timestamps the greater id wins. Chats with equal times are ordered
/// by id.
pub fn aggregate<D>(messages: &[Message], directory: &D) -> Vec<Chat>
where
    D: ChatDirectory + ?Sized,
{
    let mut latest: HashMap<&str, &Message> = HashMap::new();
    for message in messages {
        latest
            .entry(message.conversation_id())
            .and_modify(|current| {
                if (message.timestamp, &message.id) > (current.timestamp, &current.id) {
                    *current = message;
                }
            })
            .or_insert(message);
    }

    let mut chats: Vec<Chat> = latest
        .into_iter()
        .map(|(id, message)| Chat {
            id: id.to_string(),
            name: directory.contact_name(id).unwrap_or_default(),
            last_message: message.summary_text(),
            last_time: message.timestamp,
            from_me: message.from_me,
            is_group: is_group_id(id),
            avatar: directory.avatar_path(id),
        })
        .collect();
    chats.sort_by(|a, b| b.last_time.cmp(&a.last_time).then_with(|| a.id.cmp(&b.id)));
    chats
}

/// Messages in conversation `id` (by chat or sender id), oldest first.
pub fn messages_for_chat(messages: &[Message], id: &str) -> Vec<Message> {
    let mut matching: Vec<Message> = messages
        .iter()
        .filter(|m| m.chat_id == id || m.sender_id == id)
        .cloned()
        .collect();
    matching.sort_by_key(|m| m.timestamp);
    matching
}
