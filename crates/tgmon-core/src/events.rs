//! Structured engine event stream for "log in real time" consumers.
//!
//! Every event is mirrored into `tracing`; subscribers that fall behind lose
//! the oldest events instead of slowing the engine down.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::AccountName;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineEvent {
    pub timestamp: DateTime<Utc>,
    pub account: Option<AccountName>,
    pub level: EventLevel,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, level: EventLevel, account: Option<&AccountName>, message: impl Into<String>) {
        let message = message.into();
        let acct = account.map(AccountName::as_str).unwrap_or("-");
        match level {
            EventLevel::Debug => tracing::debug!(account = acct, "{message}"),
            EventLevel::Info => tracing::info!(account = acct, "{message}"),
            EventLevel::Warn => tracing::warn!(account = acct, "{message}"),
            EventLevel::Error => tracing::error!(account = acct, "{message}"),
        }

        // No subscribers is fine.
        let _ = self.tx.send(EngineEvent {
            timestamp: Utc::now(),
            account: account.cloned(),
            level,
            message,
        });
    }

    pub fn info(&self, account: Option<&AccountName>, message: impl Into<String>) {
        self.emit(EventLevel::Info, account, message);
    }

    pub fn warn(&self, account: Option<&AccountName>, message: impl Into<String>) {
        self.emit(EventLevel::Warn, account, message);
    }

    pub fn error(&self, account: Option<&AccountName>, message: impl Into<String>) {
        self.emit(EventLevel::Error, account, message);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
