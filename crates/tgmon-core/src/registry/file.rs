//! JSON-file registry, re-read whenever the file's mtime changes.
//!
//! Layout:
//!
//! ```json
//! {
//!   "accounts": [{ "name": "main", "token_env": "MAIN_BOT_TOKEN", "enabled": true }],
//!   "watches": [{ "id": 1, "account": "main", "source_ref": "@rustlang", "enabled": true }],
//!   "aggregator": { "source_ref": "-1001234567890", "account": "main" }
//! }
//! ```

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::SystemTime,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    domain::{AccountName, ChatId, Source, WatchId},
    errors::Error,
    registry::{Account, AggregatorConfig, Credential, Registry, WatchEntry},
    Result,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RegistryDoc {
    #[serde(default)]
    accounts: Vec<AccountDoc>,
    #[serde(default)]
    watches: Vec<WatchDoc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    aggregator: Option<AggregatorDoc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AccountDoc {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_env: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WatchDoc {
    id: i64,
    account: String,
    source_ref: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chat_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AggregatorDoc {
    source_ref: String,
    account: String,
}

fn default_true() -> bool {
    true
}

impl AccountDoc {
    fn to_account(&self) -> Result<Account> {
        let credential = match (&self.token, &self.token_env) {
            (Some(t), _) => Credential::Token(t.clone()),
            (None, Some(key)) => Credential::Env(key.clone()),
            (None, None) => {
                return Err(Error::Config(format!(
                    "account '{}' has neither token nor token_env",
                    self.name
                )))
            }
        };
        Ok(Account {
            name: AccountName::new(self.name.clone()),
            credential,
            enabled: self.enabled,
        })
    }
}

impl RegistryDoc {
    fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for a in &self.accounts {
            if a.name.trim().is_empty() {
                return Err(Error::Config("account with empty name".to_string()));
            }
            if !names.insert(a.name.as_str()) {
                return Err(Error::Config(format!("duplicate account '{}'", a.name)));
            }
        }

        let mut watch_keys = HashSet::new();
        for w in &self.watches {
            if !names.contains(w.account.as_str()) {
                return Err(Error::Config(format!(
                    "watch {} refers to unknown account '{}'",
                    w.id, w.account
                )));
            }
            if !watch_keys.insert((w.account.as_str(), w.id)) {
                return Err(Error::Config(format!(
                    "duplicate watch id {} for account '{}'",
                    w.id, w.account
                )));
            }
        }

        if let Some(agg) = &self.aggregator {
            if !names.contains(agg.account.as_str()) {
                return Err(Error::Config(format!(
                    "aggregator refers to unknown account '{}'",
                    agg.account
                )));
            }
        }
        Ok(())
    }
}

struct Cached {
    doc: RegistryDoc,
    modified: Option<SystemTime>,
}

pub struct FileRegistry {
    path: PathBuf,
    cache: Mutex<Cached>,
}

impl FileRegistry {
    /// Open an existing registry file.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let md = tokio::fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Config(format!("registry file not found: {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        if md.is_dir() {
            return Err(Error::InvalidPath {
                path,
                reason: "is a directory".to_string(),
            });
        }

        let doc = read_doc(&path).await?;
        Ok(Self {
            path,
            cache: Mutex::new(Cached {
                doc,
                modified: md.modified().ok(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document, reloaded first if the file changed on disk.
    ///
    /// A file that fails to parse mid-edit keeps the last good document.
    async fn current(&self) -> Result<RegistryDoc> {
        let mut cached = self.cache.lock().await;
        let modified = tokio::fs::metadata(&self.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());

        if modified.is_some() && modified != cached.modified {
            match read_doc(&self.path).await {
                Ok(doc) => {
                    tracing::debug!(path = %self.path.display(), "registry reloaded");
                    cached.doc = doc;
                    cached.modified = modified;
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), error = %e, "registry reload failed, keeping previous contents");
                }
            }
        }
        Ok(cached.doc.clone())
    }
}

async fn read_doc(path: &Path) -> Result<RegistryDoc> {
    let txt = tokio::fs::read_to_string(path).await?;
    let doc: RegistryDoc = serde_json::from_str(&txt)?;
    doc.validate()?;
    Ok(doc)
}

async fn write_doc_atomic(path: &Path, doc: &RegistryDoc) -> Result<()> {
    let txt = serde_json::to_string_pretty(doc)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, txt).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Registry for FileRegistry {
    async fn get_account(&self, name: &AccountName) -> Result<Account> {
        let doc = self.current().await?;
        doc.accounts
            .iter()
            .find(|a| a.name == name.0)
            .ok_or_else(|| Error::NotFound(format!("account '{name}'")))?
            .to_account()
    }

    async fn list_enabled_accounts(&self) -> Result<Vec<Account>> {
        let doc = self.current().await?;
        doc.accounts
            .iter()
            .filter(|a| a.enabled)
            .map(AccountDoc::to_account)
            .collect()
    }

    async fn list_watches(&self, account: &AccountName) -> Result<Vec<WatchEntry>> {
        let doc = self.current().await?;
        Ok(doc
            .watches
            .iter()
            .filter(|w| w.account == account.0)
            .map(|w| WatchEntry {
                id: WatchId(w.id),
                source_ref: w.source_ref.clone(),
                enabled: w.enabled,
                resolved_chat_id: w.chat_id.map(ChatId),
                resolved_title: w.title.clone(),
            })
            .collect())
    }

    async fn get_aggregator(&self) -> Result<Option<AggregatorConfig>> {
        let doc = self.current().await?;
        Ok(doc.aggregator.map(|a| AggregatorConfig {
            source_ref: a.source_ref,
            via_account: AccountName::new(a.account),
        }))
    }

    async fn record_resolution(
        &self,
        account: &AccountName,
        watch: WatchId,
        source: &Source,
    ) -> Result<()> {
        // Hold the cache lock across read-modify-write so concurrent monitors
        // don't clobber each other's updates.
        let mut cached = self.cache.lock().await;
        let mut doc = read_doc(&self.path).await?;

        let Some(entry) = doc
            .watches
            .iter_mut()
            .find(|w| w.account == account.0 && w.id == watch.0)
        else {
            return Ok(()); // removed meanwhile
        };
        if entry.chat_id == Some(source.chat_id.0) && entry.title.as_deref() == Some(source.title.as_str())
        {
            return Ok(());
        }
        entry.chat_id = Some(source.chat_id.0);
        entry.title = Some(source.title.clone());

        write_doc_atomic(&self.path, &doc).await?;
        cached.modified = tokio::fs::metadata(&self.path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
        cached.doc = doc;
        Ok(())
    }
}
