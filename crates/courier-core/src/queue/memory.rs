//! In-memory message store.
//!
//! Every operation takes the state lock exactly once, so each call is atomic
//! with respect to every other call. Useful for tests and single-process setups;
//! nothing survives a restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{LeasePolicy, RetryPolicy};
use crate::domain::{MessageId, MessageRecord, MessageState, Payload, StoreError, WorkerId};
use crate::observability::QueueCounts;
use crate::ports::{Clock, FailureReport, IdGenerator, MessageStore, SystemClock, UlidGenerator};

/// In-memory store state.
#[derive(Default)]
struct InMemoryStoreState {
    /// All message records (single source of truth).
    records: HashMap<MessageId, MessageRecord>,
}

impl InMemoryStoreState {
    fn owned_pending<'a>(
        &'a self,
        owner: &'a WorkerId,
    ) -> impl Iterator<Item = &'a MessageRecord> + 'a {
        self.records
            .values()
            .filter(move |r| r.is_pending() && r.is_owned_by(owner))
    }

    fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            match record.state() {
                MessageState::Pending if record.owner.is_some() => counts.claimed += 1,
                MessageState::Pending => counts.pending += 1,
                MessageState::Sent => counts.sent += 1,
                MessageState::TerminallyFailed => counts.terminally_failed += 1,
            }
        }
        counts
    }
}

/// In-memory `MessageStore`.
pub struct InMemoryMessageStore {
    state: Arc<Mutex<InMemoryStoreState>>,
    retry_policy: RetryPolicy,
    lease_policy: LeasePolicy,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator,
}

impl InMemoryMessageStore {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self::with_clock(retry_policy, Arc::new(SystemClock))
    }

    pub fn with_clock(retry_policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryStoreState::default())),
            retry_policy,
            lease_policy: LeasePolicy::default(),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
        }
    }

    pub fn with_lease_policy(mut self, lease_policy: LeasePolicy) -> Self {
        self.lease_policy = lease_policy;
        self
    }

    /// Snapshot of every record (for tests and dumps).
    pub async fn all(&self) -> Vec<MessageRecord> {
        let state = self.state.lock().await;
        state.records.values().cloned().collect()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn enqueue(&self, payload: Payload) -> Result<MessageId, StoreError> {
        let id = self.ids.generate_message_id();
        let record = MessageRecord::new(id, payload, self.clock.now());

        let mut state = self.state.lock().await;
        state.records.insert(id, record);
        Ok(id)
    }

    async fn count_owned_by(&self, owner: &WorkerId) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.owned_pending(owner).count())
    }

    async fn claim_unowned(
        &self,
        owner: &WorkerId,
        limit: usize,
    ) -> Result<Vec<MessageId>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let stale_before = self.lease_policy.stale_before(now);
        let max_attempts = self.retry_policy.max_attempts;

        // 判定と書き込みを同じロック区間で行う（read-then-write の競合を作らない）
        let mut state = self.state.lock().await;
        let mut claimed = Vec::with_capacity(limit);
        for record in state.records.values_mut() {
            if claimed.len() == limit {
                break;
            }
            if record.is_claimable(stale_before, max_attempts) {
                record.claim(owner, now);
                claimed.push(record.id);
            }
        }
        Ok(claimed)
    }

    async fn fetch_owned_by(
        &self,
        owner: &WorkerId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.owned_pending(owner).take(limit).cloned().collect())
    }

    async fn record_sent(&self, owner: &WorkerId, ids: &[MessageId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut updated = 0;
        for id in ids {
            if let Some(record) = state.records.get_mut(id) {
                if record.is_pending() && record.is_owned_by(owner) {
                    record.mark_sent(now);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn record_failed(
        &self,
        owner: &WorkerId,
        ids: &[MessageId],
    ) -> Result<FailureReport, StoreError> {
        let mut report = FailureReport::default();
        if ids.is_empty() {
            return Ok(report);
        }
        let max_attempts = self.retry_policy.max_attempts;
        let mut state = self.state.lock().await;
        for id in ids {
            let Some(record) = state.records.get_mut(id) else {
                continue;
            };
            if !(record.is_pending() && record.is_owned_by(owner)) {
                continue;
            }
            if record.mark_failed(max_attempts) {
                report.exhausted.push(*id);
            } else {
                report.retried.push(*id);
            }
        }
        Ok(report)
    }

    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn release_owned_by(&self, owner: &WorkerId) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for record in state.records.values_mut() {
            if record.is_pending() && record.is_owned_by(owner) {
                record.release();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        Ok(state.counts())
    }
}
