//! Bounded FIFO hand-off between account monitors and the single forwarder.
//!
//! One queue preserves arrival order, so records of the same account leave in
//! the order their events were observed. When the queue stays full past the
//! producer's bounded wait, the oldest pending record is dropped to make room.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{domain::MessageRecord, stats::StatsRegistry};

#[derive(Debug)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The queue stayed full; this older record was evicted to make room.
    DroppedOldest(MessageRecord),
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<MessageRecord>,
    closed: bool,
    dropped_total: u64,
}

pub struct DispatchQueue {
    capacity: usize,
    enqueue_timeout: Duration,
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
    stats: Arc<StatsRegistry>,
}

impl DispatchQueue {
    pub fn new(capacity: usize, enqueue_timeout: Duration, stats: Arc<StatsRegistry>) -> Self {
        Self {
            capacity: capacity.max(1),
            enqueue_timeout,
            state: Mutex::new(QueueState::default()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            stats,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn dropped_total(&self) -> u64 {
        self.lock().dropped_total
    }

    /// Enqueue a record, waiting up to the configured timeout for space.
    ///
    /// Never blocks past that timeout, and returns immediately once `cancel`
    /// fires; in both cases the full-queue policy (drop oldest) applies.
    pub async fn push(&self, record: MessageRecord, cancel: &CancellationToken) -> EnqueueOutcome {
        let deadline = Instant::now() + self.enqueue_timeout;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.lock();
                if st.items.len() < self.capacity {
                    st.items.push_back(record);
                    drop(st);
                    self.not_empty.notify_one();
                    return EnqueueOutcome::Enqueued;
                }
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = tokio::time::sleep_until(deadline) => break,
                _ = cancel.cancelled() => break,
            }
        }

        self.push_evicting(record)
    }

    fn push_evicting(&self, record: MessageRecord) -> EnqueueOutcome {
        let mut st = self.lock();
        let evicted = if st.items.len() >= self.capacity {
            st.items.pop_front()
        } else {
            None
        };
        st.items.push_back(record);
        if evicted.is_some() {
            st.dropped_total += 1;
        }
        drop(st);
        self.not_empty.notify_one();

        match evicted {
            Some(old) => {
                self.stats.counters(&old.account).record_dropped();
                EnqueueOutcome::DroppedOldest(old)
            }
            None => EnqueueOutcome::Enqueued,
        }
    }

    /// Wait for the next record.
    ///
    /// Returns `None` once the queue is closed and empty, or when `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<MessageRecord> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.lock();
                if let Some(rec) = st.items.pop_front() {
                    drop(st);
                    self.not_full.notify_one();
                    return Some(rec);
                }
                if st.closed {
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn try_pop(&self) -> Option<MessageRecord> {
        let rec = self.lock().items.pop_front();
        if rec.is_some() {
            self.not_full.notify_one();
        }
        rec
    }

    /// No more producers: `pop` drains what is left and then returns `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
    }
}
