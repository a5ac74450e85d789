//! Engine lifecycle: wires monitors, the dispatch queue and the forwarder.
//!
//! Startup order is aggregator first (nothing is monitored if there is nowhere
//! to deliver), then the forwarder, then one supervised monitor per account.
//! Shutdown runs the other way: monitors stop producing, the queue is closed,
//! and the forwarder drains it within the grace period.

use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, Mutex as StdMutex},
};

use tokio::{
    sync::{broadcast, watch, Mutex},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::Backoff,
    config::EngineConfig,
    dispatch::DispatchQueue,
    domain::{AccountName, Source, WatchRef},
    errors::Error,
    events::{EngineEvent, EventBus},
    forwarder::{Forwarder, ForwarderReport},
    messaging::{
        port::{SessionConnector, SessionHandle},
        throttled::{ThrottleConfig, ThrottledSession},
    },
    monitor::{AccountMonitor, MonitorState},
    registry::{Account, Registry},
    stats::{AccountStats, StatsRegistry},
    Result,
};

type StateMap = Arc<StdMutex<BTreeMap<AccountName, watch::Receiver<MonitorState>>>>;

struct Running {
    shutdown: CancellationToken,
    hard_stop: CancellationToken,
    queue: Arc<DispatchQueue>,
    monitors: JoinSet<()>,
    forwarder: JoinHandle<ForwarderReport>,
}

pub struct Engine {
    registry: Arc<dyn Registry>,
    connector: Arc<dyn SessionConnector>,
    config: EngineConfig,
    events: EventBus,
    stats: Arc<StatsRegistry>,
    states: StateMap,
    running: Mutex<Option<Running>>,
}

impl Engine {
    pub fn new(
        registry: Arc<dyn Registry>,
        connector: Arc<dyn SessionConnector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            events: EventBus::new(config.event_buffer),
            stats: Arc::new(StatsRegistry::new()),
            states: StateMap::default(),
            running: Mutex::new(None),
            config,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> Vec<AccountStats> {
        self.stats.snapshot()
    }

    pub fn monitor_states(&self) -> Vec<(AccountName, MonitorState)> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .iter()
            .map(|(name, rx)| (name.clone(), *rx.borrow()))
            .collect()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Records waiting for the forwarder.
    pub async fn pending(&self) -> usize {
        match self.running.lock().await.as_ref() {
            Some(r) => r.queue.len(),
            None => 0,
        }
    }

    /// Start the pipeline with a single account's monitor.
    pub async fn start(&self, name: &AccountName) -> Result<()> {
        let account = self.registry.get_account(name).await?;
        if !account.enabled {
            return Err(Error::Config(format!("account '{name}' is disabled")));
        }
        self.launch(vec![account]).await
    }

    /// Start the pipeline with a monitor for every enabled account.
    pub async fn start_all(&self) -> Result<Vec<AccountName>> {
        let accounts = self.registry.list_enabled_accounts().await?;
        if accounts.is_empty() {
            return Err(Error::Config("no enabled accounts".into()));
        }
        let names = accounts.iter().map(|a| a.name.clone()).collect();
        self.launch(accounts).await?;
        Ok(names)
    }

    async fn launch(&self, accounts: Vec<Account>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Config("engine is already running".into()));
        }

        let (aggregator_session, aggregator) = self.open_aggregator().await?;
        self.events.info(
            None,
            format!(
                "forwarding to '{}' ({})",
                aggregator.title,
                aggregator.chat_id.0
            ),
        );

        let queue = Arc::new(DispatchQueue::new(
            self.config.queue_capacity,
            self.config.enqueue_timeout,
            self.stats.clone(),
        ));
        let hard_stop = CancellationToken::new();
        let forwarder = Forwarder::new(
            Box::new(ThrottledSession::new(
                aggregator_session,
                ThrottleConfig::from(&self.config),
            )),
            aggregator.chat_id,
            queue.clone(),
            self.stats.clone(),
            self.events.clone(),
            self.config.backoff,
            self.config.send_max_attempts,
        );
        let forwarder = tokio::spawn(forwarder.run(hard_stop.clone()));

        let shutdown = CancellationToken::new();
        let mut monitors = JoinSet::new();
        for account in accounts {
            self.events
                .info(Some(&account.name), "starting monitor");
            monitors.spawn(supervise(
                account,
                MonitorDeps {
                    connector: self.connector.clone(),
                    registry: self.registry.clone(),
                    queue: queue.clone(),
                    events: self.events.clone(),
                    config: self.config,
                    states: self.states.clone(),
                },
                shutdown.clone(),
            ));
        }

        *running = Some(Running {
            shutdown,
            hard_stop,
            queue,
            monitors,
            forwarder,
        });
        Ok(())
    }

    /// Open, validate and resolve the aggregator destination.
    async fn open_aggregator(&self) -> Result<(Box<dyn SessionHandle>, Source)> {
        let cfg = self
            .registry
            .get_aggregator()
            .await?
            .ok_or(Error::NoAggregator)?;
        let via = self.registry.get_account(&cfg.via_account).await?;
        let session = self.connector.open(&via).await?;

        let resolved = async {
            session.connect().await?;
            session.resolve(&WatchRef::parse(&cfg.source_ref)).await
        }
        .await;

        match resolved {
            Ok(source) => Ok((session, source)),
            Err(err) => {
                session.disconnect().await;
                self.events.error(
                    Some(&via.name),
                    format!("aggregator '{}' unavailable: {err}", cfg.source_ref),
                );
                Err(err)
            }
        }
    }

    /// Stop every monitor, then let the forwarder drain the queue.
    ///
    /// Records still queued when the drain grace period ends are logged and
    /// counted as failed. Calling this when nothing runs is a no-op.
    pub async fn stop(&self) -> ForwarderReport {
        let Some(mut running) = self.running.lock().await.take() else {
            return ForwarderReport::default();
        };

        self.events.info(None, "stopping monitors");
        running.shutdown.cancel();
        while let Some(res) = running.monitors.join_next().await {
            if let Err(err) = res {
                tracing::error!(error = %err, "monitor task failed during shutdown");
            }
        }

        running.queue.close();
        let pending = running.queue.len();
        if pending > 0 {
            self.events
                .info(None, format!("draining {pending} queued record(s)"));
        }

        let grace = self.config.drain_grace;
        let joined = match tokio::time::timeout(grace, &mut running.forwarder).await {
            Ok(joined) => joined,
            Err(_) => {
                self.events.warn(
                    None,
                    format!("drain grace of {grace:?} elapsed; abandoning remaining records"),
                );
                running.hard_stop.cancel();
                running.forwarder.await
            }
        };

        let report = joined.unwrap_or_else(|err| {
            tracing::error!(error = %err, "forwarder task failed");
            ForwarderReport::default()
        });
        self.events.info(
            None,
            format!(
                "stopped: {} delivered, {} failed, {} abandoned",
                report.delivered, report.failed, report.abandoned
            ),
        );
        report
    }

    /// `start(name)`, wait for `shutdown`, then `stop()`.
    pub async fn run_account(
        &self,
        name: &AccountName,
        shutdown: impl Future<Output = ()>,
    ) -> Result<ForwarderReport> {
        self.start(name).await?;
        shutdown.await;
        Ok(self.stop().await)
    }

    /// `start_all()`, wait for `shutdown`, then `stop()`.
    pub async fn run_all(&self, shutdown: impl Future<Output = ()>) -> Result<ForwarderReport> {
        self.start_all().await?;
        shutdown.await;
        Ok(self.stop().await)
    }
}

struct MonitorDeps {
    connector: Arc<dyn SessionConnector>,
    registry: Arc<dyn Registry>,
    queue: Arc<DispatchQueue>,
    events: EventBus,
    config: EngineConfig,
    states: StateMap,
}

/// Keep one account's monitor alive.
///
/// A panicking monitor is restarted after a backoff delay; after
/// `supervision_threshold` crashes the account is given up on. Other accounts
/// and the forwarder are unaffected either way.
async fn supervise(account: Account, deps: MonitorDeps, shutdown: CancellationToken) {
    let name = account.name.clone();
    let mut backoff = Backoff::new(deps.config.backoff);
    let mut crashes = 0u32;

    loop {
        let monitor = AccountMonitor::new(
            account.clone(),
            deps.connector.clone(),
            deps.registry.clone(),
            deps.queue.clone(),
            deps.events.clone(),
            deps.config,
        );
        deps.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.clone(), monitor.state());

        match tokio::spawn(monitor.run(shutdown.clone())).await {
            Ok(()) => break,
            Err(err) if err.is_panic() => {
                crashes += 1;
                if shutdown.is_cancelled() || crashes >= deps.config.supervision_threshold.max(1) {
                    deps.events.error(
                        Some(&name),
                        format!("monitor crashed {crashes} time(s); giving up on this account"),
                    );
                    break;
                }
                deps.events
                    .error(Some(&name), format!("monitor crashed; restarting ({crashes})"));
                if !backoff.wait(&shutdown).await {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        backoff::BackoffPolicy,
        domain::ChatId,
        registry::MemoryRegistry,
        testing::{FakeConnector, FakeSession},
    };

    const AGG: ChatId = ChatId(-999);

    struct Setup {
        registry: Arc<MemoryRegistry>,
        connector: Arc<FakeConnector>,
        aggregator: FakeSession,
        sessions: Vec<FakeSession>,
    }

    fn config() -> EngineConfig {
        EngineConfig {
            send_min_interval: Duration::ZERO,
            send_per_chat_interval: Duration::ZERO,
            drain_grace: Duration::from_secs(5),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(5),
                max: Duration::from_millis(20),
                jitter: 0.0,
            },
            ..EngineConfig::default()
        }
    }

    /// Accounts `a`, `b`, `c`, each watching one public channel; aggregator
    /// reached through account `agg`.
    fn setup() -> Setup {
        let registry = Arc::new(MemoryRegistry::new());
        let connector = Arc::new(FakeConnector::new());

        let aggregator = FakeSession::new("agg");
        aggregator.add_source("-999", AGG, None, "Aggregator");
        connector.add(aggregator.clone());
        registry.upsert_account("agg", "0:agg", false);
        registry.set_aggregator("-999", "agg");

        let mut sessions = Vec::new();
        for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
            let chat = -100 - i as i64;
            let handle = format!("{name}_channel");
            let session = FakeSession::new(name);
            session.add_source(&handle, ChatId(chat), Some(&handle), name);
            connector.add(session.clone());
            registry.upsert_account(name, "1:x", true);
            registry.upsert_watch(name, 1, &format!("@{handle}"), true);
            sessions.push(session);
        }

        Setup {
            registry,
            connector,
            aggregator,
            sessions,
        }
    }

    fn engine(s: &Setup, config: EngineConfig) -> Engine {
        Engine::new(s.registry.clone(), s.connector.clone(), config)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition within 3s");
    }

    async fn wait_listening(engine: &Engine, count: usize) {
        wait_until(|| {
            engine
                .monitor_states()
                .iter()
                .filter(|(_, s)| *s == MonitorState::Listening)
                .count()
                == count
        })
        .await;
    }

    #[tokio::test]
    async fn missing_aggregator_is_fatal() {
        let s = setup();
        s.registry.clear_aggregator();
        let engine = engine(&s, config());
        assert!(matches!(engine.start_all().await, Err(Error::NoAggregator)));
        assert!(!engine.is_running().await);
        assert_eq!(s.connector.open_calls(), 0);
    }

    #[tokio::test]
    async fn unresolvable_aggregator_is_fatal() {
        let s = setup();
        s.registry.set_aggregator("@nowhere_at_all", "agg");
        let engine = engine(&s, config());
        assert!(matches!(
            engine.start_all().await,
            Err(Error::Resolution { .. })
        ));
        assert_eq!(s.aggregator.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn start_rejects_unknown_and_disabled_accounts() {
        let s = setup();
        let engine = engine(&s, config());
        assert!(matches!(
            engine.start(&AccountName::new("zed")).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            engine.start(&AccountName::new("agg")).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn run_all_forwards_from_every_account() {
        let s = setup();
        let engine = engine(&s, config());
        let started = engine.start_all().await.unwrap();
        assert_eq!(started.len(), 3);
        wait_listening(&engine, 3).await;

        s.sessions[0].push_text(-100, 10, "from a");
        s.sessions[1].push_text(-101, 20, "from b");
        s.sessions[2].push_text(-102, 30, "from c");
        wait_until(|| s.aggregator.sent_texts().len() == 3).await;

        let texts = s.aggregator.sent_texts();
        assert!(texts.iter().any(|t| t.ends_with("https://t.me/a_channel/10")));
        assert!(texts.iter().any(|t| t.ends_with("https://t.me/c_channel/30")));

        engine.stop().await;
        let stats = engine.stats();
        assert_eq!(stats.iter().map(|s| s.forwarded).sum::<u64>(), 3);
        assert!(engine
            .monitor_states()
            .iter()
            .all(|(_, st)| *st == MonitorState::Disconnected));
    }

    #[tokio::test]
    async fn stop_drains_queued_records() {
        let s = setup();
        s.aggregator.set_send_delay(Duration::from_millis(20));
        let engine = engine(&s, config());
        engine.start_all().await.unwrap();
        wait_listening(&engine, 3).await;

        for seq in 1..=4 {
            s.sessions[0].push_text(-100, seq, "a");
        }
        for seq in 1..=3 {
            s.sessions[1].push_text(-101, seq, "b");
            s.sessions[2].push_text(-102, seq, "c");
        }

        // One record may be in flight, invisible to both counts.
        let sent = s.aggregator.sent_log();
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let delivered = sent.lock().unwrap().len();
                if delivered + engine.pending().await >= 9 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.pending().await > 0);

        let report = engine.stop().await;
        assert_eq!(report.failed + report.abandoned, 0);
        assert_eq!(s.aggregator.sent_texts().len(), 10);

        // Per-account order survives the shared queue.
        let a_seqs: Vec<String> = s
            .aggregator
            .sent_texts()
            .into_iter()
            .filter(|t| t.contains("a_channel"))
            .collect();
        for (i, t) in a_seqs.iter().enumerate() {
            assert!(t.ends_with(&format!("/{}", i + 1)), "{t}");
        }
    }

    #[tokio::test]
    async fn drain_grace_bounds_shutdown() {
        let s = setup();
        s.aggregator.set_send_delay(Duration::from_millis(200));
        let engine = engine(
            &s,
            EngineConfig {
                drain_grace: Duration::from_millis(100),
                ..config()
            },
        );
        engine.start(&AccountName::new("a")).await.unwrap();
        wait_listening(&engine, 1).await;

        for seq in 1..=5 {
            s.sessions[0].push_text(-100, seq, "slow");
        }
        tokio::time::timeout(Duration::from_secs(3), async {
            while engine.pending().await < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let started = std::time::Instant::now();
        let report = engine.stop().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.delivered + report.failed + report.abandoned, 5);
        let a = engine
            .stats()
            .into_iter()
            .find(|st| st.account.as_str() == "a")
            .unwrap();
        assert_eq!(a.forwarded + a.failed, 5);
    }

    #[tokio::test]
    async fn one_account_failing_does_not_affect_others() {
        let s = setup();
        s.connector
            .fail_open("b", Error::AuthExpired("token revoked".into()));
        let engine = engine(&s, config());
        engine.start_all().await.unwrap();
        wait_listening(&engine, 2).await;

        s.sessions[0].push_text(-100, 1, "still flowing");
        wait_until(|| s.aggregator.sent_texts().len() == 1).await;

        let states: BTreeMap<_, _> = engine.monitor_states().into_iter().collect();
        assert_eq!(states[&AccountName::new("b")], MonitorState::Disconnected);

        engine.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_start_twice_fails() {
        let s = setup();
        let engine = engine(&s, config());
        engine.start(&AccountName::new("a")).await.unwrap();
        assert!(matches!(
            engine.start(&AccountName::new("b")).await,
            Err(Error::Config(_))
        ));
        engine.stop().await;
        assert_eq!(engine.stop().await, ForwarderReport::default());
        assert!(!engine.is_running().await);
        assert_eq!(s.aggregator.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn run_account_blocks_until_shutdown() {
        let s = setup();
        let engine = engine(&s, config());
        s.sessions[0].push_text(-100, 7, "queued before start");

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let sent = s.aggregator.sent_log();
        let stopper = tokio::spawn(async move {
            tokio::time::timeout(Duration::from_secs(3), async {
                while sent.lock().unwrap().is_empty() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .ok();
            let _ = tx.send(());
        });

        let report = engine
            .run_account(&AccountName::new("a"), async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        stopper.await.unwrap();
        assert_eq!(report.delivered, 1);
    }
}
