//! Unbounded FIFO of pending usage records.
//!
//! Producers are request handlers calling [`UsageQueue::enqueue`]; the
//! drainer is the sole consumer. `outstanding` counts queued plus
//! in-flight records, so [`UsageQueue::wait_empty`] only returns once the
//! drainer has acked everything it pulled, not merely once the deque is
//! empty.
//!
//! The queue is deliberately unbounded to match the agent's observable
//! behavior: `enqueue` never fails and `report` never blocks. Prolonged
//! disconnection therefore grows memory without bound; callers who care
//! can watch `len()` and call `drain()`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tallyproto::UsageRecord;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct UsageQueue {
    records: Mutex<VecDeque<UsageRecord>>,
    /// Queued + in-flight records.
    outstanding: AtomicUsize,
    /// Records delivered over the queue's lifetime.
    delivered: AtomicU64,
    /// Publish attempts that failed and sent a record back to the queue.
    failed_publishes: AtomicU64,
    /// Signalled on enqueue, for the waiting consumer.
    ready: Notify,
    /// Signalled when `outstanding` hits zero, for `wait_empty` waiters.
    settled: Notify,
}

impl UsageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking; never fails.
    pub fn enqueue(&self, record: UsageRecord) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        records.push_back(record);
        drop(records);
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.ready.notify_one();
    }

    /// Return a record the drainer could not deliver. Keeps its
    /// outstanding slot and goes to the front so the retry happens first;
    /// FIFO order across re-enqueues is not guaranteed.
    pub fn requeue(&self, record: UsageRecord) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        records.push_front(record);
        drop(records);
        self.ready.notify_one();
    }

    /// Count a publish attempt that failed.
    pub fn record_publish_failure(&self) {
        self.failed_publishes.fetch_add(1, Ordering::SeqCst);
    }

    /// Pull the next record, waiting up to `timeout`. Drainer-only. The
    /// record stays counted as outstanding until [`UsageQueue::ack`].
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<UsageRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.ready.notified();
            if let Some(record) = self.pop() {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop();
            }
        }
    }

    fn pop(&self) -> Option<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Mark one in-flight record delivered.
    pub fn ack(&self) {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        self.settle_one();
    }

    /// Drop one in-flight record without counting it as delivered.
    pub fn discard(&self) {
        self.settle_one();
    }

    fn settle_one(&self) {
        let previous = self.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "settle without an outstanding record");
        if previous == 1 {
            self.settled.notify_waiters();
        }
    }

    /// Records delivered so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Failed publish attempts so far.
    pub fn failed_publishes(&self) -> u64 {
        self.failed_publishes.load(Ordering::SeqCst)
    }

    /// Records currently queued (excludes the one the drainer holds).
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when nothing is queued or in flight.
    pub fn is_empty(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Administrative clear. Returns how many queued records were dropped.
    pub fn drain(&self) -> usize {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let dropped = records.len();
        records.clear();
        drop(records);
        if dropped > 0 {
            let previous = self.outstanding.fetch_sub(dropped, Ordering::SeqCst);
            if previous == dropped {
                self.settled.notify_waiters();
            }
        }
        dropped
    }

    /// Block until no outstanding records remain or `timeout` elapses.
    /// Returns false on timeout without cancelling drainer work.
    pub async fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let settled = self.settled.notified();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, settled).await.is_err() {
                return self.is_empty();
            }
        }
    }
}
