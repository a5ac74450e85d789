use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::Serialize;

use crate::domain::AccountName;

#[derive(Debug, Default)]
pub struct AccountCounters {
    forwarded: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl AccountCounters {
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    pub account: AccountName,
    pub forwarded: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Per-account delivery counters for dashboards.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    inner: Mutex<BTreeMap<AccountName, Arc<AccountCounters>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self, account: &AccountName) -> Arc<AccountCounters> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(account.clone()).or_default().clone()
    }

    pub fn get(&self, account: &AccountName) -> Option<AccountStats> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(account).map(|c| stats_of(account, c))
    }

    pub fn snapshot(&self) -> Vec<AccountStats> {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.iter().map(|(name, c)| stats_of(name, c)).collect()
    }
}

fn stats_of(account: &AccountName, c: &AccountCounters) -> AccountStats {
    AccountStats {
        account: account.clone(),
        forwarded: c.forwarded.load(Ordering::Relaxed),
        dropped: c.dropped.load(Ordering::Relaxed),
        failed: c.failed.load(Ordering::Relaxed),
    }
}
