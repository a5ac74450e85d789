//! Turning one outgoing message into Bot API sends.
//!
//! A message becomes a head part followed by zero or more follow-ups: the
//! media (with or without caption), then any text that did not fit. Only the
//! head may fail the whole send. Once it is out, retrying the message would
//! post it twice, so follow-ups are retried here and never surface an error.

use std::time::Duration;

use async_trait::async_trait;
use teloxide::{ApiError, RequestError};

use tgmon_core::{
    domain::{AccountName, ChatId, MediaHandle, MessageId},
    messaging::types::OutgoingMessage,
};

/// Bot API limit for media captions, in UTF-16 code units.
pub const CAPTION_LIMIT: usize = 1024;

/// Bot API limit for message text, in UTF-16 code units.
pub const MESSAGE_LIMIT: usize = 4096;

/// Telegram measures text length in UTF-16 code units.
pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

pub fn fits_in_caption(text: &str) -> bool {
    utf16_len(text) <= CAPTION_LIMIT
}

/// Split `text` into pieces of at most `limit` UTF-16 units, preferring to
/// break at a newline, then at a space.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || utf16_len(text) <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    while utf16_len(rest) > limit {
        let window_end = utf16_floor(rest, limit);
        let window = &rest[..window_end];
        let split_at = match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(i) if i > 0 => i,
            _ => window_end,
        };
        chunks.push(rest[..split_at].to_string());
        rest = rest[split_at..].trim_start_matches(|c: char| c == '\n' || c == ' ');
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

/// Largest char boundary whose prefix fits in `limit` UTF-16 units. Always
/// covers at least one char.
fn utf16_floor(text: &str, limit: usize) -> usize {
    let mut units = 0;
    for (i, c) in text.char_indices() {
        units += c.len_utf16();
        if units > limit {
            return if i == 0 { c.len_utf8() } else { i };
        }
    }
    text.len()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Part {
    Text(String),
    Media {
        media: MediaHandle,
        caption: Option<String>,
    },
}

impl Part {
    fn is_media(&self) -> bool {
        matches!(self, Part::Media { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    pub head: Part,
    pub follow_ups: Vec<Part>,
}

impl Plan {
    pub fn for_message(message: &OutgoingMessage) -> Self {
        match &message.media {
            None => Self::text_only(&message.text),
            Some(media) if fits_in_caption(&message.text) => Plan {
                head: Part::Media {
                    media: media.clone(),
                    caption: Some(message.text.clone()),
                },
                follow_ups: Vec::new(),
            },
            Some(media) => Plan {
                head: Part::Media {
                    media: media.clone(),
                    caption: None,
                },
                follow_ups: chunk_text(&message.text, MESSAGE_LIMIT)
                    .into_iter()
                    .map(Part::Text)
                    .collect(),
            },
        }
    }

    pub fn text_only(text: &str) -> Self {
        let mut chunks = chunk_text(text, MESSAGE_LIMIT).into_iter().map(Part::Text);
        let head = chunks.next().unwrap_or_else(|| Part::Text(String::new()));
        Plan {
            head,
            follow_ups: chunks.collect(),
        }
    }
}

/// One Bot API send.
#[async_trait]
pub trait PartSender: Send + Sync {
    async fn send_part(
        &self,
        chat: ChatId,
        part: &Part,
        disable_preview: bool,
    ) -> Result<MessageId, RequestError>;
}

/// Retry budget for follow-up parts.
#[derive(Clone, Copy, Debug)]
pub struct FollowUpRetry {
    pub attempts: usize,
    pub delay: Duration,
}

impl Default for FollowUpRetry {
    fn default() -> Self {
        Self {
            attempts: 4,
            delay: Duration::from_secs(1),
        }
    }
}

/// Send `message` as planned. Returns the id of the head message.
///
/// A media head rejected by the API (other than for an invalid token) is
/// replaced by the text alone: file ids are scoped to the bot that saw them.
pub async fn send_planned<S>(
    sender: &S,
    account: &AccountName,
    chat: ChatId,
    message: &OutgoingMessage,
    retry: FollowUpRetry,
) -> Result<MessageId, RequestError>
where
    S: PartSender + ?Sized,
{
    let preview = message.disable_link_preview;
    let mut plan = Plan::for_message(message);

    let first = sender.send_part(chat, &plan.head, preview).await;
    let head = match first {
        Ok(id) => id,
        Err(RequestError::Api(api))
            if plan.head.is_media() && !matches!(api, ApiError::InvalidToken) =>
        {
            tracing::warn!(
                account = %account,
                chat_id = chat.0,
                error = %api,
                "media rejected; sending text only"
            );
            plan = Plan::text_only(&message.text);
            sender.send_part(chat, &plan.head, preview).await?
        }
        Err(e) => return Err(e),
    };

    let total = plan.follow_ups.len();
    for (idx, part) in plan.follow_ups.iter().enumerate() {
        if let Err(e) = send_follow_up(sender, chat, part, preview, retry).await {
            tracing::error!(
                account = %account,
                chat_id = chat.0,
                part = idx + 1,
                parts = total,
                error = %e,
                "follow-up part not delivered; message is incomplete"
            );
            break;
        }
    }
    Ok(head)
}

async fn send_follow_up<S>(
    sender: &S,
    chat: ChatId,
    part: &Part,
    preview: bool,
    retry: FollowUpRetry,
) -> Result<MessageId, RequestError>
where
    S: PartSender + ?Sized,
{
    let mut attempt = 1;
    loop {
        let err = match sender.send_part(chat, part, preview).await {
            Ok(id) => return Ok(id),
            Err(e) => e,
        };
        let wait = match &err {
            RequestError::RetryAfter(wait) => wait.duration(),
            RequestError::Network(_) | RequestError::Io(_) => retry.delay,
            _ => return Err(err),
        };
        if attempt >= retry.attempts {
            return Err(err);
        }
        attempt += 1;
        tracing::debug!(
            chat_id = chat.0,
            attempt,
            wait_ms = wait.as_millis() as u64,
            "retrying follow-up part"
        );
        tokio::time::sleep(wait).await;
    }
}
