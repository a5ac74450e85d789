use crate::domain::{ChatId, MediaHandle, MessageId};

/// Who sent an inbound message, as far as the transport knows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sender {
    User {
        first_name: String,
        last_name: Option<String>,
        username: Option<String>,
    },
    /// Posts made on behalf of a chat (channel posts, anonymous admins).
    Chat { title: Option<String> },
}

/// Payload shape of an inbound event, before classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawPayload {
    Text(String),
    Photo {
        file_id: String,
        caption: Option<String>,
    },
    Video {
        file_id: String,
        caption: Option<String>,
    },
    Document {
        file_id: String,
        caption: Option<String>,
    },
    /// Joins, pins, title changes and other service notices.
    Service,
    /// Anything else the transport delivers (stickers, polls, voice, ...).
    Unsupported(String),
}

/// One inbound event as produced by a session subscription.
#[derive(Clone, Debug)]
pub struct RawEvent {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub sender: Option<Sender>,
    pub payload: RawPayload,
}

/// A fully formatted message ready for the aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    pub media: Option<MediaHandle>,
    pub disable_link_preview: bool,
}
