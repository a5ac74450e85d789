use std::{collections::BTreeMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    domain::{AccountName, Source, WatchId},
    errors::Error,
    registry::{Account, AggregatorConfig, Credential, Registry, WatchEntry},
    Result,
};

#[derive(Default)]
struct State {
    accounts: BTreeMap<AccountName, Account>,
    watches: BTreeMap<AccountName, Vec<WatchEntry>>,
    aggregator: Option<AggregatorConfig>,
}

/// In-process registry, for embedders and tests.
#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut st)
    }

    pub fn upsert_account(&self, name: &str, token: &str, enabled: bool) {
        let account = Account {
            name: AccountName::new(name),
            credential: Credential::Token(token.to_string()),
            enabled,
        };
        self.with_state(|st| {
            st.accounts.insert(account.name.clone(), account);
        });
    }

    pub fn upsert_watch(&self, account: &str, id: i64, source_ref: &str, enabled: bool) {
        let entry = WatchEntry {
            id: WatchId(id),
            source_ref: source_ref.to_string(),
            enabled,
            resolved_chat_id: None,
            resolved_title: None,
        };
        self.with_state(|st| {
            let list = st.watches.entry(AccountName::new(account)).or_default();
            match list.iter_mut().find(|w| w.id == entry.id) {
                Some(existing) => *existing = entry,
                None => list.push(entry),
            }
        });
    }

    /// Returns `false` if the watch does not exist.
    pub fn set_watch_enabled(&self, account: &str, id: i64, enabled: bool) -> bool {
        self.with_state(|st| {
            st.watches
                .get_mut(&AccountName::new(account))
                .and_then(|list| list.iter_mut().find(|w| w.id == WatchId(id)))
                .map(|w| w.enabled = enabled)
                .is_some()
        })
    }

    pub fn remove_watch(&self, account: &str, id: i64) {
        self.with_state(|st| {
            if let Some(list) = st.watches.get_mut(&AccountName::new(account)) {
                list.retain(|w| w.id != WatchId(id));
            }
        });
    }

    pub fn set_aggregator(&self, source_ref: &str, via_account: &str) {
        self.with_state(|st| {
            st.aggregator = Some(AggregatorConfig {
                source_ref: source_ref.to_string(),
                via_account: AccountName::new(via_account),
            });
        });
    }

    pub fn clear_aggregator(&self) {
        self.with_state(|st| st.aggregator = None);
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_account(&self, name: &AccountName) -> Result<Account> {
        self.with_state(|st| st.accounts.get(name).cloned())
            .ok_or_else(|| Error::NotFound(format!("account '{name}'")))
    }

    async fn list_enabled_accounts(&self) -> Result<Vec<Account>> {
        Ok(self.with_state(|st| {
            st.accounts
                .values()
                .filter(|a| a.enabled)
                .cloned()
                .collect()
        }))
    }

    async fn list_watches(&self, account: &AccountName) -> Result<Vec<WatchEntry>> {
        Ok(self.with_state(|st| st.watches.get(account).cloned().unwrap_or_default()))
    }

    async fn get_aggregator(&self) -> Result<Option<AggregatorConfig>> {
        Ok(self.with_state(|st| st.aggregator.clone()))
    }

    async fn record_resolution(
        &self,
        account: &AccountName,
        watch: WatchId,
        source: &Source,
    ) -> Result<()> {
        self.with_state(|st| {
            if let Some(w) = st
                .watches
                .get_mut(account)
                .and_then(|list| list.iter_mut().find(|w| w.id == watch))
            {
                w.resolved_chat_id = Some(source.chat_id);
                w.resolved_title = Some(source.title.clone());
            }
        });
        Ok(())
    }
}
