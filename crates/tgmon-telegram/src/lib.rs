//! Telegram adapter (teloxide).
//!
//! This crate implements the `tgmon-core` session port over the Telegram Bot
//! API, one bot token per account.

use std::time::Duration;

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{InputFile, LinkPreviewOptions, Recipient},
    ApiError, RequestError,
};

pub mod connector;
pub mod outbound;
pub mod updates;

pub use connector::BotConnector;

use tgmon_core::{
    domain::{AccountName, ChatId, ContentKind, MediaHandle, MessageId, MessageRef, Source, WatchRef},
    errors::Error,
    messaging::{
        port::{EventSubscription, SessionHandle},
        types::OutgoingMessage,
    },
    Result,
};

use crate::{
    outbound::{FollowUpRetry, Part, PartSender},
    updates::UpdateSubscription,
};

/// Headroom on top of the long-poll timeout for the HTTP client.
const HTTP_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct TelegramSession {
    account: AccountName,
    bot: Bot,
    poll_timeout: Duration,
}

impl TelegramSession {
    pub fn new(account: AccountName, token: &str, poll_timeout: Duration) -> Result<Self> {
        // The client must outlive a full long-poll round trip.
        let client = teloxide::net::default_reqwest_settings()
            .timeout(poll_timeout + HTTP_TIMEOUT_MARGIN)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        Ok(Self {
            account,
            bot: Bot::with_client(token, client),
            poll_timeout,
        })
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    async fn send_text(
        &self,
        chat: teloxide::types::ChatId,
        text: &str,
        disable_preview: bool,
    ) -> std::result::Result<Message, RequestError> {
        let mut req = self.bot.send_message(chat, text.to_string());
        if disable_preview {
            req = req.link_preview_options(no_link_preview());
        }
        req.await
    }

    async fn send_media(
        &self,
        chat: teloxide::types::ChatId,
        media: &MediaHandle,
        caption: Option<&str>,
    ) -> std::result::Result<Message, RequestError> {
        let file = InputFile::file_id(media.file_id.clone());
        let caption = caption.map(str::to_string);
        match media.kind {
            ContentKind::Photo => {
                let mut req = self.bot.send_photo(chat, file);
                if let Some(c) = caption {
                    req = req.caption(c);
                }
                req.await
            }
            ContentKind::Video => {
                let mut req = self.bot.send_video(chat, file);
                if let Some(c) = caption {
                    req = req.caption(c);
                }
                req.await
            }
            ContentKind::Document | ContentKind::Text => {
                let mut req = self.bot.send_document(chat, file);
                if let Some(c) = caption {
                    req = req.caption(c);
                }
                req.await
            }
        }
    }
}

fn no_link_preview() -> LinkPreviewOptions {
    LinkPreviewOptions {
        is_disabled: true,
        url: None,
        prefer_small_media: false,
        prefer_large_media: false,
        show_above_text: false,
    }
}

#[async_trait]
impl PartSender for TelegramSession {
    async fn send_part(
        &self,
        chat: ChatId,
        part: &Part,
        disable_preview: bool,
    ) -> std::result::Result<MessageId, RequestError> {
        let chat = Self::tg_chat(chat);
        let sent = match part {
            Part::Text(text) => self.send_text(chat, text, disable_preview).await?,
            Part::Media { media, caption } => {
                self.send_media(chat, media, caption.as_deref()).await?
            }
        };
        Ok(MessageId(sent.id.0))
    }
}

/// Translate a Bot API failure into the engine's error taxonomy.
pub fn map_request_error(e: RequestError) -> Error {
    match e {
        RequestError::RetryAfter(wait) => Error::RateLimited(wait.duration()),
        RequestError::Api(ApiError::InvalidToken) => {
            Error::AuthExpired("bot token was rejected".into())
        }
        RequestError::Api(ApiError::TerminatedByOtherGetUpdates) => {
            Error::Connection("another poller is using this bot token".into())
        }
        RequestError::Api(api) => Error::Rejected(api.to_string()),
        RequestError::Network(err) => Error::Connection(err.to_string()),
        RequestError::Io(err) => Error::Connection(err.to_string()),
        other => Error::Delivery(other.to_string()),
    }
}

fn resolution_error(reference: &WatchRef, e: RequestError) -> Error {
    match e {
        RequestError::Api(ApiError::ChatNotFound) => Error::Resolution {
            reference: reference.to_string(),
            reason: "chat not found, or the bot is not a member".into(),
        },
        RequestError::Api(ApiError::InvalidToken) => map_request_error(e),
        RequestError::Api(api) => Error::Resolution {
            reference: reference.to_string(),
            reason: api.to_string(),
        },
        other => map_request_error(other),
    }
}

#[async_trait]
impl SessionHandle for TelegramSession {
    fn account(&self) -> &AccountName {
        &self.account
    }

    async fn connect(&self) -> Result<()> {
        let me = self.bot.get_me().await.map_err(map_request_error)?;
        tracing::info!(
            account = %self.account,
            bot = %me.username(),
            "telegram session ready"
        );
        Ok(())
    }

    async fn resolve(&self, reference: &WatchRef) -> Result<Source> {
        let recipient: Recipient = match reference {
            WatchRef::Id(id) => teloxide::types::ChatId(*id).into(),
            WatchRef::Handle(h) => Recipient::ChannelUsername(format!("@{h}")),
        };
        let chat = self
            .bot
            .get_chat(recipient)
            .await
            .map_err(|e| resolution_error(reference, e))?;

        let title = chat
            .title()
            .or_else(|| chat.first_name())
            .map(str::to_string)
            .unwrap_or_else(|| reference.to_string());
        Ok(Source {
            chat_id: ChatId(chat.id.0),
            handle: chat.username().map(str::to_string),
            title,
        })
    }

    async fn subscribe(&self) -> Result<Box<dyn EventSubscription>> {
        // Long polling is refused while a webhook is set.
        self.bot
            .delete_webhook()
            .await
            .map_err(map_request_error)?;
        Ok(Box::new(UpdateSubscription::new(
            self.bot.clone(),
            self.account.clone(),
            self.poll_timeout,
        )))
    }

    async fn send(&self, to: ChatId, message: &OutgoingMessage) -> Result<MessageRef> {
        let message_id =
            outbound::send_planned(self, &self.account, to, message, FollowUpRetry::default())
                .await
                .map_err(map_request_error)?;
        Ok(MessageRef {
            chat_id: to,
            message_id,
        })
    }

    async fn disconnect(&self) {
        tracing::debug!(account = %self.account, "telegram session released");
    }
}
