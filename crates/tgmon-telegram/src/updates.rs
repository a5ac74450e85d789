//! Long-poll `getUpdates` subscription and Bot API message conversion.

use std::{collections::VecDeque, time::Duration};

use async_trait::async_trait;
use teloxide::{
    prelude::*,
    types::{AllowedUpdate, MediaKind, MessageKind, UpdateKind},
};

use tgmon_core::{
    domain::{AccountName, ChatId, MessageId},
    messaging::{
        port::EventSubscription,
        types::{RawEvent, RawPayload, Sender},
    },
    Result,
};

use crate::map_request_error;

/// One account's update stream.
///
/// Starts at offset 0, so Telegram redelivers every update that was not yet
/// confirmed when the previous subscription ended.
pub struct UpdateSubscription {
    bot: Bot,
    account: AccountName,
    poll_timeout: Duration,
    offset: i32,
    pending: VecDeque<RawEvent>,
}

impl UpdateSubscription {
    pub(crate) fn new(bot: Bot, account: AccountName, poll_timeout: Duration) -> Self {
        Self {
            bot,
            account,
            poll_timeout,
            offset: 0,
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl EventSubscription for UpdateSubscription {
    async fn next_event(&mut self) -> Result<Option<RawEvent>> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Ok(Some(ev));
            }

            let updates = self
                .bot
                .get_updates()
                .offset(self.offset)
                .timeout(poll_timeout_secs(self.poll_timeout))
                .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::ChannelPost])
                .await
                .map_err(map_request_error)?;

            tracing::debug!(
                account = %self.account,
                count = updates.len(),
                "got telegram updates"
            );
            for update in updates {
                self.offset = update.id.as_offset();
                match update.kind {
                    UpdateKind::Message(msg) | UpdateKind::ChannelPost(msg) => {
                        self.pending.push_back(raw_event(&msg));
                    }
                    other => {
                        tracing::debug!(account = %self.account, "ignoring update: {other:?}");
                    }
                }
            }
        }
    }
}

fn poll_timeout_secs(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX)
}

pub fn raw_event(msg: &Message) -> RawEvent {
    RawEvent {
        chat_id: ChatId(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
        sender: sender_of(msg),
        payload: payload_of(msg),
    }
}

fn sender_of(msg: &Message) -> Option<Sender> {
    if let Some(chat) = &msg.sender_chat {
        return Some(Sender::Chat {
            title: chat.title().map(str::to_string),
        });
    }
    if let Some(user) = &msg.from {
        return Some(Sender::User {
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            username: user.username.clone(),
        });
    }
    // Channel posts carry no sender; the channel speaks for itself.
    msg.chat.is_channel().then(|| Sender::Chat {
        title: msg.chat.title().map(str::to_string),
    })
}

fn payload_of(msg: &Message) -> RawPayload {
    let MessageKind::Common(common) = &msg.kind else {
        return RawPayload::Service;
    };
    match &common.media_kind {
        MediaKind::Text(t) => RawPayload::Text(t.text.clone()),
        MediaKind::Photo(p) => match p.photo.last() {
            Some(size) => RawPayload::Photo {
                file_id: size.file.id.clone(),
                caption: p.caption.clone(),
            },
            None => RawPayload::Unsupported("photo without sizes".into()),
        },
        MediaKind::Video(v) => RawPayload::Video {
            file_id: v.video.file.id.clone(),
            caption: v.caption.clone(),
        },
        MediaKind::Document(d) => RawPayload::Document {
            file_id: d.document.file.id.clone(),
            caption: d.caption.clone(),
        },
        other => RawPayload::Unsupported(media_kind_name(other).to_string()),
    }
}

fn media_kind_name(kind: &MediaKind) -> &'static str {
    match kind {
        MediaKind::Animation(_) => "animation",
        MediaKind::Audio(_) => "audio",
        MediaKind::Contact(_) => "contact",
        MediaKind::Game(_) => "game",
        MediaKind::Location(_) => "location",
        MediaKind::Poll(_) => "poll",
        MediaKind::Sticker(_) => "sticker",
        MediaKind::Venue(_) => "venue",
        MediaKind::VideoNote(_) => "video note",
        MediaKind::Voice(_) => "voice",
        _ => "other",
    }
}
