use async_trait::async_trait;

use crate::{
    domain::{AccountName, ChatId, MessageRef, Source, WatchRef},
    messaging::types::{OutgoingMessage, RawEvent},
    registry::Account,
    Result,
};

/// An authenticated connection for one account.
///
/// Handles are produced by a [`SessionConnector`] and owned by exactly one
/// engine task for the duration of a run.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn account(&self) -> &AccountName;

    /// Validate the session against the transport.
    ///
    /// Fails with `AuthExpired` when the credential is no longer accepted and
    /// with `Connection` on transient network trouble.
    async fn connect(&self) -> Result<()>;

    /// Map a watch reference to the canonical source it names.
    async fn resolve(&self, reference: &WatchRef) -> Result<Source>;

    /// Open the single multiplexed event subscription for this account.
    async fn subscribe(&self) -> Result<Box<dyn EventSubscription>>;

    async fn send(&self, to: ChatId, message: &OutgoingMessage) -> Result<MessageRef>;

    async fn disconnect(&self);
}

#[async_trait]
pub trait EventSubscription: Send {
    /// Wait for the next inbound event.
    ///
    /// `Ok(None)` means the transport closed the stream; errors are
    /// connection-level failures.
    async fn next_event(&mut self) -> Result<Option<RawEvent>>;
}

/// Boundary to the credential/auth subsystem: turns a registry account into a
/// usable session handle, or fails.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn open(&self, account: &Account) -> Result<Box<dyn SessionHandle>>;
}
