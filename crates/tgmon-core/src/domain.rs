use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registry-unique account name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountName(pub String);

impl AccountName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric), the origin sequence number used in links.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Watch identifier, unique per account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchId(pub i64);

/// A configured watch reference: a raw numeric chat id or a public handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum WatchRef {
    Id(i64),
    Handle(String),
}

impl WatchRef {
    /// Parse the registry's textual form. Numeric strings are chat ids; anything
    /// else is a handle, with an optional leading `@` or `https://t.me/` prefix.
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();
        if let Ok(id) = s.parse::<i64>() {
            return WatchRef::Id(id);
        }
        let s = s
            .strip_prefix("https://t.me/")
            .or_else(|| s.strip_prefix("http://t.me/"))
            .or_else(|| s.strip_prefix("t.me/"))
            .unwrap_or(s);
        let s = s.strip_prefix('@').unwrap_or(s);
        WatchRef::Handle(s.trim_end_matches('/').to_string())
    }
}

impl fmt::Display for WatchRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchRef::Id(id) => write!(f, "{id}"),
            WatchRef::Handle(h) => write!(f, "@{h}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

/// Canonical form of a resolved source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Source {
    pub chat_id: ChatId,
    /// Stable public handle, when one exists. Its presence is what makes a
    /// source public.
    pub handle: Option<String>,
    pub title: String,
}

impl Source {
    pub fn visibility(&self) -> Visibility {
        if self.handle.is_some() {
            Visibility::Public
        } else {
            Visibility::Private
        }
    }

    /// Canonical identifier used in permalinks (`handle` for public sources).
    pub fn canonical_id(&self) -> String {
        match &self.handle {
            Some(h) => h.clone(),
            None => self.chat_id.0.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Photo,
    Video,
    Document,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Photo => "photo",
            ContentKind::Video => "video",
            ContentKind::Document => "document",
        }
    }
}

/// Opaque media payload reference. Passed through to the destination, never decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaHandle {
    pub kind: ContentKind,
    pub file_id: String,
}

/// Canonical normalized representation of one inbound event.
#[derive(Clone, Debug)]
pub struct MessageRecord {
    pub account: AccountName,
    pub source: Arc<Source>,
    pub sender_name: String,
    pub kind: ContentKind,
    /// Text body, or the caption for media.
    pub text: Option<String>,
    pub media: Option<MediaHandle>,
    pub seq: MessageId,
    pub arrived_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn visibility(&self) -> Visibility {
        self.source.visibility()
    }
}
