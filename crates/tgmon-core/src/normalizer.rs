//! Raw session events → canonical [`MessageRecord`]s.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};

use crate::{
    domain::{AccountName, ChatId, ContentKind, MediaHandle, MessageRecord, Source},
    messaging::types::{RawEvent, RawPayload, Sender},
};

pub const UNKNOWN_SENDER: &str = "Unknown";

/// The enabled, resolved watches of one account, keyed by chat.
#[derive(Clone, Debug, Default)]
pub struct ActiveWatches {
    by_chat: HashMap<ChatId, Arc<Source>>,
}

impl ActiveWatches {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source: Arc<Source>) {
        self.by_chat.insert(source.chat_id, source);
    }

    pub fn get(&self, chat_id: ChatId) -> Option<&Arc<Source>> {
        self.by_chat.get(&chat_id)
    }

    pub fn len(&self) -> usize {
        self.by_chat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_chat.is_empty()
    }
}

/// Best-effort display name; never fails on missing sender metadata.
pub fn sender_display_name(sender: Option<&Sender>) -> String {
    let name = match sender {
        Some(Sender::User {
            first_name,
            last_name,
            username,
        }) => {
            let full = [Some(first_name.as_str()), last_name.as_deref()]
                .into_iter()
                .flatten()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if full.is_empty() {
                username.clone()
            } else {
                Some(full)
            }
        }
        Some(Sender::Chat { title }) => title.clone(),
        None => None,
    };

    name.filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string())
}

/// Content kind, text/caption and media handle of a payload, or `None` for
/// payloads the engine does not forward.
pub fn classify(payload: RawPayload) -> Option<(ContentKind, Option<String>, Option<MediaHandle>)> {
    let media = |kind, file_id| Some(MediaHandle { kind, file_id });
    match payload {
        RawPayload::Text(text) => Some((ContentKind::Text, Some(text), None)),
        RawPayload::Photo { file_id, caption } => {
            Some((ContentKind::Photo, caption, media(ContentKind::Photo, file_id)))
        }
        RawPayload::Video { file_id, caption } => {
            Some((ContentKind::Video, caption, media(ContentKind::Video, file_id)))
        }
        RawPayload::Document { file_id, caption } => Some((
            ContentKind::Document,
            caption,
            media(ContentKind::Document, file_id),
        )),
        RawPayload::Service | RawPayload::Unsupported(_) => None,
    }
}

/// Turn a raw event into a record, or skip it.
///
/// Skips events from chats that are not in `watches` and payloads that are not
/// text, photo, video or document.
pub fn normalize(
    account: &AccountName,
    watches: &ActiveWatches,
    event: RawEvent,
    arrived_at: DateTime<Utc>,
) -> Option<MessageRecord> {
    let source = watches.get(event.chat_id)?;
    let sender_name = sender_display_name(event.sender.as_ref());
    let (kind, text, media) = classify(event.payload)?;

    Some(MessageRecord {
        account: account.clone(),
        source: source.clone(),
        sender_name,
        kind,
        text,
        media,
        seq: event.message_id,
        arrived_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;

    fn watches() -> ActiveWatches {
        let mut w = ActiveWatches::new();
        w.insert(Arc::new(Source {
            chat_id: ChatId(-100),
            handle: Some("channel_x".into()),
            title: "X".into(),
        }));
        w
    }

    fn event(chat: i64, payload: RawPayload, sender: Option<Sender>) -> RawEvent {
        RawEvent {
            chat_id: ChatId(chat),
            message_id: MessageId(7),
            sender,
            payload,
        }
    }

    #[test]
    fn normalizes_watched_text() {
        let acct = AccountName::new("a");
        let sender = Sender::User {
            first_name: "Ada".into(),
            last_name: Some("Lovelace".into()),
            username: Some("ada".into()),
        };
        let rec = normalize(
            &acct,
            &watches(),
            event(-100, RawPayload::Text("hi".into()), Some(sender)),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rec.sender_name, "Ada Lovelace");
        assert_eq!(rec.kind, ContentKind::Text);
        assert_eq!(rec.text.as_deref(), Some("hi"));
        assert_eq!(rec.seq, MessageId(7));
        assert!(rec.media.is_none());
    }

    #[test]
    fn skips_unwatched_chats_and_unsupported_payloads() {
        let acct = AccountName::new("a");
        let w = watches();
        assert!(normalize(&acct, &w, event(-999, RawPayload::Text("x".into()), None), Utc::now()).is_none());
        assert!(normalize(&acct, &w, event(-100, RawPayload::Service, None), Utc::now()).is_none());
        assert!(normalize(
            &acct,
            &w,
            event(-100, RawPayload::Unsupported("sticker".into()), None),
            Utc::now()
        )
        .is_none());
    }

    #[test]
    fn media_kinds_carry_handles() {
        let acct = AccountName::new("a");
        let rec = normalize(
            &acct,
            &watches(),
            event(
                -100,
                RawPayload::Document {
                    file_id: "doc-1".into(),
                    caption: None,
                },
                None,
            ),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(rec.kind, ContentKind::Document);
        assert_eq!(rec.media.unwrap().file_id, "doc-1");
        assert_eq!(rec.sender_name, UNKNOWN_SENDER);
    }

    #[test]
    fn sender_name_fallbacks() {
        assert_eq!(sender_display_name(None), "Unknown");
        assert_eq!(
            sender_display_name(Some(&Sender::User {
                first_name: " ".into(),
                last_name: None,
                username: Some("nick".into()),
            })),
            "nick"
        );
        assert_eq!(
            sender_display_name(Some(&Sender::Chat {
                title: Some("News".into())
            })),
            "News"
        );
        assert_eq!(
            sender_display_name(Some(&Sender::Chat { title: None })),
            "Unknown"
        );
    }
}
