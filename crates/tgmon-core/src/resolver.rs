//! Watch reference → canonical source, cached per account for a monitoring run.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use regex::Regex;

use crate::{
    domain::{Source, WatchRef},
    errors::Error,
    messaging::port::SessionHandle,
    Result,
};

/// Public handle syntax: a letter, then letters, digits or underscores, 4..=32 total.
fn handle_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{3,31}$").expect("valid regex"))
}

pub fn is_valid_handle(handle: &str) -> bool {
    handle_re().is_match(handle)
}

#[derive(Clone, Debug)]
enum CacheEntry {
    Resolved(Arc<Source>),
    Failed { at: Instant, reason: String },
}

#[derive(Clone, Debug)]
pub struct Resolution {
    pub source: Arc<Source>,
    /// True the first time a reference resolves during this run.
    pub fresh: bool,
}

/// Per-account resolution cache.
///
/// Successful resolutions are kept for the whole run. Failures are kept for
/// `retry_after` so a broken reference is not looked up on every event.
#[derive(Debug)]
pub struct SourceResolver {
    retry_after: Duration,
    cache: HashMap<WatchRef, CacheEntry>,
}

impl SourceResolver {
    pub fn new(retry_after: Duration) -> Self {
        Self {
            retry_after,
            cache: HashMap::new(),
        }
    }

    pub async fn resolve(
        &mut self,
        session: &dyn SessionHandle,
        reference: &WatchRef,
    ) -> Result<Resolution> {
        self.resolve_at(session, reference, Instant::now()).await
    }

    pub async fn resolve_at(
        &mut self,
        session: &dyn SessionHandle,
        reference: &WatchRef,
        now: Instant,
    ) -> Result<Resolution> {
        match self.cache.get(reference) {
            Some(CacheEntry::Resolved(source)) => {
                return Ok(Resolution {
                    source: source.clone(),
                    fresh: false,
                })
            }
            Some(CacheEntry::Failed { at, reason }) if now.duration_since(*at) < self.retry_after => {
                return Err(Error::Resolution {
                    reference: reference.to_string(),
                    reason: reason.clone(),
                });
            }
            _ => {}
        }

        if let WatchRef::Handle(h) = reference {
            if !is_valid_handle(h) {
                return Err(self.fail(reference, now, "not a valid public handle".to_string()));
            }
        }

        match session.resolve(reference).await {
            Ok(source) => {
                let source = Arc::new(source);
                self.cache
                    .insert(reference.clone(), CacheEntry::Resolved(source.clone()));
                Ok(Resolution {
                    source,
                    fresh: true,
                })
            }
            Err(Error::Resolution { reason, .. }) | Err(Error::NotFound(reason)) => {
                Err(self.fail(reference, now, reason))
            }
            // Connection-level trouble says nothing about the reference itself.
            Err(other) => Err(other),
        }
    }

    fn fail(&mut self, reference: &WatchRef, now: Instant, reason: String) -> Error {
        self.cache.insert(
            reference.clone(),
            CacheEntry::Failed {
                at: now,
                reason: reason.clone(),
            },
        );
        Error::Resolution {
            reference: reference.to_string(),
            reason,
        }
    }
}
