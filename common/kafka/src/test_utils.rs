//! Shared test utilities for the common-kafka crate.
//!
//! [`MockTransport`] is an in-memory [`Transport`] that tests script with batches, errors and
//! failures, then inspect for the polls, commits and subscription changes the client made.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::record::{PollBatch, Record};
use crate::registry::MessageHandler;
use crate::transport::Transport;

#[derive(Default)]
struct MockState {
    queued: VecDeque<PollBatch>,
    closed: bool,
    polls: usize,
    commits: Vec<Vec<Record>>,
    commit_failures: VecDeque<TransportError>,
    commit_delay: Option<Duration>,
    subscribe_failure: Option<TransportError>,
    unsubscribe_failure: Option<TransportError>,
    ping_failure: Option<TransportError>,
    subscribed: BTreeSet<String>,
    unsubscribe_calls: usize,
    close_calls: usize,
    last_allow_rebalance: Option<bool>,
}

impl MockState {
    fn take_batch(&mut self, max_records: usize) -> Option<PollBatch> {
        if self.closed {
            return Some(PollBatch::closed());
        }

        let mut batch = self.queued.pop_front()?;
        if batch.records.len() > max_records {
            let rest = batch.records.split_off(max_records);
            self.queued.push_front(PollBatch::from_records(rest));
        }
        if batch.closed {
            self.closed = true;
        }
        Some(batch)
    }
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
    notify: Notify,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_batch(&self, batch: PollBatch) {
        self.state().queued.push_back(batch);
        self.notify.notify_waiters();
    }

    /// Queue records for the next poll. Polls split them by the requested maximum.
    pub fn push_records(&self, records: Vec<Record>) {
        self.push_batch(PollBatch::from_records(records));
    }

    pub fn push_error(&self, error: TransportError) {
        self.push_batch(PollBatch::from_error(error));
    }

    /// Queue terminal closure; every poll after it returns a closed batch.
    pub fn push_closed(&self) {
        self.push_batch(PollBatch::closed());
    }

    pub fn fail_next_commit(&self, error: TransportError) {
        self.state().commit_failures.push_back(error);
    }

    /// Make every later commit sleep for `delay` before it is recorded.
    pub fn set_commit_delay(&self, delay: Duration) {
        self.state().commit_delay = Some(delay);
    }

    pub fn fail_next_subscribe(&self, error: TransportError) {
        self.state().subscribe_failure = Some(error);
    }

    /// Fail the next unsubscribe and leave the topic subscribed.
    pub fn fail_next_unsubscribe(&self, error: TransportError) {
        self.state().unsubscribe_failure = Some(error);
    }

    pub fn fail_ping(&self, error: TransportError) {
        self.state().ping_failure = Some(error);
    }

    pub fn polls(&self) -> usize {
        self.state().polls
    }

    /// Every commit attempt, failed ones included, in call order.
    pub fn commits(&self) -> Vec<Vec<Record>> {
        self.state().commits.clone()
    }

    pub fn committed_offsets(&self) -> Vec<i64> {
        self.state()
            .commits
            .iter()
            .flatten()
            .map(Record::offset)
            .collect()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.state().subscribed.iter().cloned().collect()
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.state().unsubscribe_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state().close_calls
    }

    pub fn last_allow_rebalance(&self) -> Option<bool> {
        self.state().last_allow_rebalance
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn poll_batch(&self, max_records: usize, deadline: Option<Duration>) -> PollBatch {
        let until = deadline.map(|d| Instant::now() + d);
        self.state().polls += 1;

        loop {
            let notified = self.notify.notified();
            let ready = self.state().take_batch(max_records.max(1));
            if let Some(batch) = ready {
                return batch;
            }

            match until {
                Some(until) => {
                    if tokio::time::timeout_at(until, notified).await.is_err() {
                        return PollBatch::default();
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn commit_offsets(&self, records: &[Record]) -> Result<(), TransportError> {
        let delay = self.state().commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.commits.push(records.to_vec());
        match state.commit_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn subscribe_topic(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        if let Some(error) = state.subscribe_failure.take() {
            return Err(error);
        }
        state.subscribed.insert(topic.to_owned());
        Ok(())
    }

    fn unsubscribe_topic(&self, topic: &str) -> Result<(), TransportError> {
        let mut state = self.state();
        state.unsubscribe_calls += 1;
        if let Some(error) = state.unsubscribe_failure.take() {
            return Err(error);
        }
        state.subscribed.remove(topic);
        Ok(())
    }

    async fn close(&self, allow_rebalance: bool) {
        {
            let mut state = self.state();
            state.close_calls += 1;
            state.last_allow_rebalance = Some(allow_rebalance);
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    async fn ping(&self, _timeout: Duration) -> Result<(), TransportError> {
        match self.state().ping_failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Handler that accepts every record.
pub fn noop_handler() -> Arc<dyn MessageHandler> {
    Arc::new(|_record: Record| async { anyhow::Ok(()) })
}

/// Handler that keeps every record it receives. Clones share the same list.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    records: Arc<Mutex<Vec<Record>>>,
    fail: bool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records like [`RecordingHandler::new`] but returns an error for every record.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.records().iter().map(Record::offset).collect()
    }

    pub fn count(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, record: Record) -> anyhow::Result<()> {
        let offset = record.offset();
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        anyhow::ensure!(!self.fail, "rejected record at offset {offset}");
        Ok(())
    }
}

/// Records `0..count` on `topic`, partition 0.
pub fn records(topic: &str, count: i64) -> Vec<Record> {
    (0..count).map(|offset| Record::new(topic, 0, offset)).collect()
}

/// Poll `condition` every 5ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let until = Instant::now() + timeout;
    while Instant::now() < until {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
