//! MessageStore port - 配送キューの正本（source of truth）
//!
//! すべてのワーカー間の調整はこの trait の操作だけを通して行う。
//! 各操作はストレージ側で 1 回のアトミックな操作として実装すること
//! （read-then-write で実装すると二重 claim の競合が生まれる）。

use async_trait::async_trait;

use crate::domain::{MessageId, MessageRecord, Payload, StoreError, WorkerId};
use crate::observability::QueueCounts;

/// Result of `record_failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureReport {
    /// Still pending; eligible for re-claim on the next sweep.
    pub retried: Vec<MessageId>,

    /// Reached `max_attempts` with this failure and are now terminally failed.
    pub exhausted: Vec<MessageId>,
}

impl FailureReport {
    pub fn len(&self) -> usize {
        self.retried.len() + self.exhausted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Durable, concurrently shared message queue.
///
/// `record_sent` / `record_failed` only touch messages still owned by `owner`,
/// so repeating a call with the same ids has no further effect.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a new pending, unowned message.
    async fn enqueue(&self, payload: Payload) -> Result<MessageId, StoreError>;

    /// Pending messages currently owned by `owner`.
    async fn count_owned_by(&self, owner: &WorkerId) -> Result<usize, StoreError>;

    /// Atomically assign up to `limit` claimable messages to `owner`.
    /// Selection order is unspecified.
    async fn claim_unowned(
        &self,
        owner: &WorkerId,
        limit: usize,
    ) -> Result<Vec<MessageId>, StoreError>;

    /// Up to `limit` pending messages owned by `owner`.
    async fn fetch_owned_by(
        &self,
        owner: &WorkerId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Set `sent_at = now` and clear the claim. Returns the number of messages updated.
    async fn record_sent(&self, owner: &WorkerId, ids: &[MessageId]) -> Result<u64, StoreError>;

    /// Count one failed attempt and clear the claim; finalize exhausted messages.
    async fn record_failed(
        &self,
        owner: &WorkerId,
        ids: &[MessageId],
    ) -> Result<FailureReport, StoreError>;

    /// Inspect a single message.
    async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError>;

    /// Clear the claim on every pending message held by `owner`.
    /// Operator recovery for a worker identity that is gone for good.
    async fn release_owned_by(&self, owner: &WorkerId) -> Result<u64, StoreError>;

    async fn counts(&self) -> Result<QueueCounts, StoreError>;
}
