//! Account, watch and aggregator registry as seen by the engine.
//!
//! The registry itself is managed elsewhere (CLI, web UI, hand-edited file);
//! the engine only reads it, and writes back resolved chat metadata.

pub mod file;
pub mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::{
    domain::{AccountName, ChatId, Source, WatchId, WatchRef},
    Result,
};

pub use file::FileRegistry;
pub use memory::MemoryRegistry;

/// Where an account's credential comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Token(String),
    /// Name of an environment variable holding the token.
    Env(String),
}

impl Credential {
    /// The secret itself, if available.
    pub fn reveal(&self) -> Option<String> {
        match self {
            Credential::Token(t) => Some(t.clone()),
            Credential::Env(key) => std::env::var(key).ok(),
        }
        .filter(|s| !s.trim().is_empty())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Token(_) => f.write_str("Token(<redacted>)"),
            Credential::Env(key) => write!(f, "Env({key})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub name: AccountName,
    pub credential: Credential,
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEntry {
    pub id: WatchId,
    pub source_ref: String,
    pub enabled: bool,
    /// Last resolution written back by the engine, if any.
    pub resolved_chat_id: Option<ChatId>,
    pub resolved_title: Option<String>,
}

impl WatchEntry {
    pub fn reference(&self) -> WatchRef {
        WatchRef::parse(&self.source_ref)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub source_ref: String,
    pub via_account: AccountName,
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Fails with `NotFound` if the account does not exist.
    async fn get_account(&self, name: &AccountName) -> Result<Account>;

    async fn list_enabled_accounts(&self) -> Result<Vec<Account>>;

    /// Live view: reflects edits made while a run is in progress.
    async fn list_watches(&self, account: &AccountName) -> Result<Vec<WatchEntry>>;

    async fn get_aggregator(&self) -> Result<Option<AggregatorConfig>>;

    /// Persist the resolved chat id/title of a watch.
    async fn record_resolution(
        &self,
        account: &AccountName,
        watch: WatchId,
        source: &Source,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_hides_token() {
        let c = Credential::Token("123:secret".into());
        assert_eq!(format!("{c:?}"), "Token(<redacted>)");
        assert_eq!(c.reveal().as_deref(), Some("123:secret"));
        assert_eq!(Credential::Token("  ".into()).reveal(), None);
    }
}
