use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    config::EngineConfig,
    domain::{AccountName, ChatId, MessageRef, Source, WatchRef},
    messaging::{
        port::{EventSubscription, SessionHandle},
        types::OutgoingMessage,
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* two sends (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(250),
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

impl From<&EngineConfig> for ThrottleConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            global_min_interval: cfg.send_min_interval,
            per_chat_min_interval: cfg.send_per_chat_interval,
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// SessionHandle decorator that paces outbound sends.
///
/// Best-effort defense against flood-wait responses from the destination; it
/// does not replace the forwarder's handling of explicit rate-limit signals.
pub struct ThrottledSession {
    inner: Box<dyn SessionHandle>,
    global: Mutex<IntervalLimiter>,
    per_chat_interval: Duration,
    per_chat: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledSession {
    pub fn new(inner: Box<dyn SessionHandle>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat_interval: cfg.per_chat_min_interval,
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(IntervalLimiter::new(self.per_chat_interval))))
            .clone()
    }

    async fn throttle_chat(&self, chat_id: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait]
impl SessionHandle for ThrottledSession {
    fn account(&self) -> &AccountName {
        self.inner.account()
    }

    async fn connect(&self) -> Result<()> {
        self.inner.connect().await
    }

    async fn resolve(&self, reference: &WatchRef) -> Result<Source> {
        self.inner.resolve(reference).await
    }

    async fn subscribe(&self) -> Result<Box<dyn EventSubscription>> {
        self.inner.subscribe().await
    }

    async fn send(&self, to: ChatId, message: &OutgoingMessage) -> Result<MessageRef> {
        self.throttle_chat(to.0).await;
        self.inner.send(to, message).await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;

    #[tokio::test]
    async fn limiter_spaces_reservations() {
        let mut lim = IntervalLimiter::new(Duration::from_millis(100));
        assert!(lim.reserve().is_zero());
        let second = lim.reserve();
        assert!(second > Duration::from_millis(50));
        assert!(second <= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn sends_to_same_chat_are_spaced() {
        let fake = FakeSession::new("agg");
        let sent = fake.sent_log();
        let throttled = ThrottledSession::new(
            Box::new(fake),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(0),
                per_chat_min_interval: Duration::from_millis(60),
            },
        );

        let msg = OutgoingMessage {
            text: "hi".into(),
            media: None,
            disable_link_preview: true,
        };
        let started = std::time::Instant::now();
        throttled.send(ChatId(1), &msg).await.unwrap();
        throttled.send(ChatId(1), &msg).await.unwrap();
        throttled.send(ChatId(1), &msg).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(110));
        assert_eq!(sent.lock().unwrap().len(), 3);
    }
}
