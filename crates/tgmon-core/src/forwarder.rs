//! The single consumer of the dispatch queue.
//!
//! Records are delivered one at a time through the aggregator's session, so
//! the destination sees them in queue order and never more than one in flight.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{sleep_or_cancel, Backoff, BackoffPolicy},
    dispatch::DispatchQueue,
    domain::{ChatId, MessageRecord, MessageRef},
    errors::Error,
    events::EventBus,
    formatting::to_outgoing,
    messaging::port::SessionHandle,
    stats::StatsRegistry,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForwarderReport {
    pub delivered: u64,
    pub failed: u64,
    /// Records still pending when the hard stop fired; counted as failed too.
    pub abandoned: u64,
}

enum Delivery {
    Sent(MessageRef),
    Failed(Error),
    Abandoned,
}

pub struct Forwarder {
    session: Box<dyn SessionHandle>,
    destination: ChatId,
    queue: Arc<DispatchQueue>,
    stats: Arc<StatsRegistry>,
    events: EventBus,
    backoff: BackoffPolicy,
    max_attempts: u32,
    blocked_until: Option<Instant>,
}

impl Forwarder {
    pub fn new(
        session: Box<dyn SessionHandle>,
        destination: ChatId,
        queue: Arc<DispatchQueue>,
        stats: Arc<StatsRegistry>,
        events: EventBus,
        backoff: BackoffPolicy,
        max_attempts: u32,
    ) -> Self {
        Self {
            session,
            destination,
            queue,
            stats,
            events,
            backoff,
            max_attempts: max_attempts.max(1),
            blocked_until: None,
        }
    }

    /// Deliver until the queue is closed and empty, or until `hard_stop`.
    ///
    /// After a hard stop every record left in the queue is logged and counted
    /// as failed. The aggregator session is disconnected on return.
    pub async fn run(mut self, hard_stop: CancellationToken) -> ForwarderReport {
        let mut report = ForwarderReport::default();

        while let Some(record) = self.queue.pop(&hard_stop).await {
            match self.deliver(&record, &hard_stop).await {
                Delivery::Sent(msg) => {
                    report.delivered += 1;
                    self.stats.counters(&record.account).record_forwarded();
                    tracing::debug!(
                        account = %record.account,
                        source = record.source.chat_id.0,
                        seq = record.seq.0,
                        delivered_as = msg.message_id.0,
                        "forwarded"
                    );
                }
                Delivery::Failed(err) => {
                    report.failed += 1;
                    self.record_failure(&record, &err.to_string());
                }
                Delivery::Abandoned => {
                    report.abandoned += 1;
                    self.record_failure(&record, "stopped before delivery");
                    break;
                }
            }
        }

        if hard_stop.is_cancelled() {
            while let Some(record) = self.queue.try_pop() {
                report.abandoned += 1;
                self.record_failure(&record, "stopped before delivery");
            }
        }

        self.session.disconnect().await;
        tracing::info!(
            delivered = report.delivered,
            failed = report.failed,
            abandoned = report.abandoned,
            "forwarder stopped"
        );
        report
    }

    async fn deliver(&mut self, record: &MessageRecord, cancel: &CancellationToken) -> Delivery {
        let message = to_outgoing(record);
        let mut backoff = Backoff::new(self.backoff);

        loop {
            if let Some(until) = self.blocked_until.take() {
                let wait = until.saturating_duration_since(Instant::now());
                if !sleep_or_cancel(wait, cancel).await {
                    self.blocked_until = Some(until);
                    return Delivery::Abandoned;
                }
            }

            let sent = tokio::select! {
                res = self.session.send(self.destination, &message) => res,
                _ = cancel.cancelled() => return Delivery::Abandoned,
            };

            match sent {
                Ok(msg) => return Delivery::Sent(msg),
                Err(Error::RateLimited(wait)) => {
                    // Applies to every pending record, not just this one.
                    self.blocked_until = Some(Instant::now() + wait);
                    tracing::warn!(
                        account = %record.account,
                        seq = record.seq.0,
                        wait_secs = wait.as_secs_f64(),
                        "destination rate limit; pausing sends"
                    );
                }
                Err(err) if err.is_transient() && backoff.attempts() + 1 < self.max_attempts => {
                    tracing::warn!(
                        account = %record.account,
                        seq = record.seq.0,
                        attempt = backoff.attempts() + 1,
                        error = %err,
                        "send failed; retrying"
                    );
                    if !backoff.wait(cancel).await {
                        return Delivery::Abandoned;
                    }
                }
                Err(err) => return Delivery::Failed(err),
            }
        }
    }

    fn record_failure(&self, record: &MessageRecord, reason: &str) {
        self.stats.counters(&record.account).record_failed();
        self.events.error(
            Some(&record.account),
            format!(
                "delivery failed for source {} ({}) seq {}: {reason}",
                record.source.canonical_id(),
                record.source.title,
                record.seq.0
            ),
        );
    }
}
