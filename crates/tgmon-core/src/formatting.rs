//! Aggregator text layout.
//!
//! ```text
//! • <sender>
//!
//! <text, or a [type] tag for captionless media>
//!
//! Ссылка: https://t.me/<handle>/<seq>      (public sources only)
//! ```
//!
//! The output is sent as plain text; this layout is the one bit-exact contract
//! the engine has with readers of the aggregator chat.

use crate::{
    domain::{ContentKind, MessageRecord, Source, Visibility},
    messaging::types::OutgoingMessage,
};

pub const LINK_LABEL: &str = "Ссылка";
const EMPTY_LABEL: &str = "[Пустое сообщение]";

pub fn media_label(kind: ContentKind) -> &'static str {
    match kind {
        ContentKind::Photo => "[Фото]",
        ContentKind::Video => "[Видео]",
        ContentKind::Document => "[Документ]",
        ContentKind::Text => EMPTY_LABEL,
    }
}

/// Permalink to a message, only for sources with a stable public handle.
pub fn permalink(source: &Source, seq: i32) -> Option<String> {
    match source.visibility() {
        Visibility::Public => Some(format!("https://t.me/{}/{seq}", source.canonical_id())),
        Visibility::Private => None,
    }
}

pub fn format_record(record: &MessageRecord) -> String {
    let body = match record.text.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(text) => text,
        None => media_label(record.kind),
    };

    let mut out = format!("• {}\n\n{body}", record.sender_name);
    if let Some(link) = permalink(&record.source, record.seq.0) {
        out.push_str(&format!("\n\n{LINK_LABEL}: {link}"));
    }
    out
}

/// Build the message the forwarder sends for `record`.
pub fn to_outgoing(record: &MessageRecord) -> OutgoingMessage {
    OutgoingMessage {
        text: format_record(record),
        media: record.media.clone(),
        disable_link_preview: true,
    }
}
