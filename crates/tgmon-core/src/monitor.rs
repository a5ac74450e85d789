//! Per-account monitor: one session, one multiplexed subscription, reconnects
//! with backoff until stopped.
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──ok──▶ Listening
//!      ▲                      │                  │
//!      └──── backoff ◀── failure ◀── connection lost
//!
//! any state ──stop──▶ Stopping ──▶ Disconnected (terminal)
//! ```
//!
//! The watch set is re-read from the registry for every event, so enabling or
//! disabling a watch never restarts the subscription.

use std::{
    collections::{HashSet, VecDeque},
    ops::ControlFlow,
    sync::Arc,
};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::Backoff,
    config::EngineConfig,
    dispatch::{DispatchQueue, EnqueueOutcome},
    domain::{ChatId, MessageId, Source, WatchId},
    errors::Error,
    events::EventBus,
    messaging::{
        port::{SessionConnector, SessionHandle},
        types::RawEvent,
    },
    normalizer::{normalize, ActiveWatches},
    registry::{Account, Registry, WatchEntry},
    resolver::SourceResolver,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Disconnected,
    Connecting,
    Listening,
    Stopping,
}

/// Bounded memory of recently seen messages, so a transport that replays its
/// backlog after a reconnect does not cause double forwarding.
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<(ChatId, MessageId)>,
    seen: HashSet<(ChatId, MessageId)>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Returns `true` the first time a key is seen.
    pub fn insert(&mut self, chat_id: ChatId, message_id: MessageId) -> bool {
        if self.capacity == 0 {
            return true;
        }
        let key = (chat_id, message_id);
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

enum CycleEnd {
    Stopped,
    StreamClosed,
}

pub struct AccountMonitor {
    account: Account,
    connector: Arc<dyn SessionConnector>,
    registry: Arc<dyn Registry>,
    queue: Arc<DispatchQueue>,
    events: EventBus,
    config: EngineConfig,
    state: watch::Sender<MonitorState>,
    resolver: SourceResolver,
    dedup: DedupWindow,
    backoff: Backoff,
    consecutive_failures: u32,
    watches: ActiveWatches,
    unresolved: HashSet<WatchId>,
}

impl AccountMonitor {
    pub fn new(
        account: Account,
        connector: Arc<dyn SessionConnector>,
        registry: Arc<dyn Registry>,
        queue: Arc<DispatchQueue>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        let (state, _) = watch::channel(MonitorState::Disconnected);
        Self {
            account,
            connector,
            registry,
            queue,
            events,
            resolver: SourceResolver::new(config.resolve_retry),
            dedup: DedupWindow::new(config.dedup_window),
            backoff: Backoff::new(config.backoff),
            consecutive_failures: 0,
            watches: ActiveWatches::new(),
            unresolved: HashSet::new(),
            config,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: MonitorState) {
        self.state.send_replace(next);
    }

    /// Run until `cancel` fires. Never returns early on its own: connection
    /// failures are retried, and an expired session parks the monitor.
    pub async fn run(mut self, cancel: CancellationToken) {
        let name = self.account.name.clone();
        tracing::info!(account = %name, "monitor starting");

        while !cancel.is_cancelled() {
            self.set_state(MonitorState::Connecting);
            match self.cycle(&cancel).await {
                Ok(CycleEnd::Stopped) => break,
                Ok(CycleEnd::StreamClosed) => {
                    self.set_state(MonitorState::Disconnected);
                    self.events
                        .warn(Some(&name), "event stream closed by transport; reconnecting");
                    if !self.backoff.wait(&cancel).await {
                        break;
                    }
                }
                Err(Error::AuthExpired(reason)) => {
                    self.set_state(MonitorState::Disconnected);
                    self.events.error(
                        Some(&name),
                        format!("session no longer valid, re-login required: {reason}"),
                    );
                    cancel.cancelled().await;
                    break;
                }
                Err(err) => {
                    self.set_state(MonitorState::Disconnected);
                    self.consecutive_failures += 1;
                    let threshold = self.config.supervision_threshold;
                    if threshold > 0 && self.consecutive_failures % threshold == 0 {
                        self.events.error(
                            Some(&name),
                            format!(
                                "connection failing repeatedly ({} consecutive failures): {err}",
                                self.consecutive_failures
                            ),
                        );
                    } else {
                        self.events
                            .warn(Some(&name), format!("connection failed: {err}; retrying"));
                    }
                    if !self.backoff.wait(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.set_state(MonitorState::Disconnected);
        tracing::info!(account = %name, "monitor stopped");
    }

    async fn cycle(&mut self, cancel: &CancellationToken) -> Result<CycleEnd> {
        let session = tokio::select! {
            res = self.connector.open(&self.account) => res?,
            _ = cancel.cancelled() => return Ok(CycleEnd::Stopped),
        };

        let result = self.listen(session.as_ref(), cancel).await;
        if matches!(result, Ok(CycleEnd::Stopped)) {
            self.set_state(MonitorState::Stopping);
        }
        session.disconnect().await;
        result
    }

    async fn listen(
        &mut self,
        session: &dyn SessionHandle,
        cancel: &CancellationToken,
    ) -> Result<CycleEnd> {
        tokio::select! {
            res = session.connect() => res?,
            _ = cancel.cancelled() => return Ok(CycleEnd::Stopped),
        }
        let mut subscription = tokio::select! {
            res = session.subscribe() => res?,
            _ = cancel.cancelled() => return Ok(CycleEnd::Stopped),
        };

        self.set_state(MonitorState::Listening);
        self.backoff.reset();
        self.consecutive_failures = 0;
        tokio::select! {
            res = self.refresh_watches(session) => res?,
            _ = cancel.cancelled() => return Ok(CycleEnd::Stopped),
        }
        self.events.info(
            Some(&self.account.name),
            format!("listening on {} source(s)", self.watches.len()),
        );

        loop {
            let next = tokio::select! {
                res = subscription.next_event() => res?,
                _ = cancel.cancelled() => return Ok(CycleEnd::Stopped),
            };
            let Some(event) = next else {
                return Ok(CycleEnd::StreamClosed);
            };
            if let ControlFlow::Break(end) = self.handle_event(session, event, cancel).await? {
                return Ok(end);
            }
        }
    }

    async fn handle_event(
        &mut self,
        session: &dyn SessionHandle,
        event: RawEvent,
        cancel: &CancellationToken,
    ) -> Result<ControlFlow<CycleEnd>> {
        if !self.dedup.insert(event.chat_id, event.message_id) {
            tracing::debug!(
                account = %self.account.name,
                chat_id = event.chat_id.0,
                seq = event.message_id.0,
                "duplicate event skipped"
            );
            return Ok(ControlFlow::Continue(()));
        }

        // Registry reads and source lookups can be slow; stop must not wait on them.
        tokio::select! {
            res = self.refresh_watches(session) => res?,
            _ = cancel.cancelled() => return Ok(ControlFlow::Break(CycleEnd::Stopped)),
        }
        let Some(record) = normalize(&self.account.name, &self.watches, event, Utc::now()) else {
            return Ok(ControlFlow::Continue(()));
        };

        if let EnqueueOutcome::DroppedOldest(old) = self.queue.push(record, cancel).await {
            self.events.warn(
                Some(&old.account),
                format!(
                    "dispatch queue full; dropped oldest record (source {}, seq {})",
                    old.source.canonical_id(),
                    old.seq.0
                ),
            );
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Rebuild the active watch set from the live registry.
    ///
    /// Only connection-level failures are returned; registry and per-watch
    /// resolution problems are reported and leave the affected watches inactive.
    async fn refresh_watches(&mut self, session: &dyn SessionHandle) -> Result<()> {
        let entries = match self.registry.list_watches(&self.account.name).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    account = %self.account.name,
                    error = %err,
                    "registry read failed; keeping previous watch set"
                );
                return Ok(());
            }
        };

        let mut active = ActiveWatches::new();
        for entry in entries.iter().filter(|w| w.enabled) {
            let reference = entry.reference();
            match self.resolver.resolve(session, &reference).await {
                Ok(resolution) => {
                    if resolution.fresh {
                        self.on_resolved(entry, &resolution.source).await;
                    }
                    active.insert(resolution.source);
                }
                Err(err @ (Error::Connection(_) | Error::AuthExpired(_))) => return Err(err),
                Err(err) => {
                    if self.unresolved.insert(entry.id) {
                        self.events.warn(
                            Some(&self.account.name),
                            format!("watch {} not activated: {err}", entry.id.0),
                        );
                    }
                }
            }
        }
        self.watches = active;
        Ok(())
    }

    async fn on_resolved(&mut self, entry: &WatchEntry, source: &Source) {
        self.unresolved.remove(&entry.id);
        tracing::info!(
            account = %self.account.name,
            watch = entry.id.0,
            chat_id = source.chat_id.0,
            title = %source.title,
            "watch resolved"
        );

        let unchanged = entry.resolved_chat_id == Some(source.chat_id)
            && entry.resolved_title.as_deref() == Some(source.title.as_str());
        if unchanged {
            return;
        }
        if let Err(err) = self
            .registry
            .record_resolution(&self.account.name, entry.id, source)
            .await
        {
            tracing::warn!(
                account = %self.account.name,
                watch = entry.id.0,
                error = %err,
                "failed to record resolution"
            );
        }
    }
}
