//! DeliveryWorker - 配送ループ
//!
//! # フロー（1 sweep）
//! Idle → Claiming → Delivering → Recording → Idle
//!
//! 1. claim protocol でバッチを確保（空なら何もせず次の tick まで待つ）
//! 2. transport.deliver() を 1 件ずつ呼び、成功/失敗に振り分ける
//! 3. record_sent → record_failed で結果を書き戻す
//!
//! Delivery is at-least-once: if recording a success fails, the message stays
//! claimed and is delivered again on a later sweep.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::claim::claim_batch;
use crate::config::WorkerConfig;
use crate::domain::{ConfigError, MessageId, StoreError, WorkerId};
use crate::ports::{FailureReport, MessageStore, Transport};

/// Attempts per bookkeeping call within one sweep.
const RECORD_ATTEMPTS: usize = 2;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Messages in this sweep's batch (carried over + newly claimed).
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Subset of `failed` that just became terminally failed.
    pub exhausted: usize,
    /// Bookkeeping calls that failed even after retrying.
    pub record_errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.claimed == 0
    }
}

/// Claims, delivers and records batches for one worker identity.
pub struct DeliveryWorker {
    config: WorkerConfig,
    store: Arc<dyn MessageStore>,
    transport: Arc<dyn Transport>,
}

impl DeliveryWorker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            transport,
        })
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.config.worker_id
    }

    /// Run one claim → deliver → record cycle.
    ///
    /// A storage error while claiming is returned; recording errors are logged
    /// and counted in the report instead.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let owner = &self.config.worker_id;
        let batch = claim_batch(self.store.as_ref(), owner, self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(SweepReport::default());
        }

        let mut succeeded = Vec::with_capacity(batch.len());
        let mut failed = Vec::new();
        for message in &batch {
            match self.transport.deliver(message).await {
                Ok(()) => {
                    debug!(worker = %owner, message_id = %message.id, "delivered");
                    succeeded.push(message.id);
                }
                Err(err) => {
                    warn!(
                        worker = %owner,
                        message_id = %message.id,
                        attempt = message.failed_attempts + 1,
                        error = %err,
                        "delivery failed"
                    );
                    failed.push(message.id);
                }
            }
        }

        let mut report = SweepReport {
            claimed: batch.len(),
            ..SweepReport::default()
        };

        match self.record_sent(&succeeded).await {
            Ok(n) => report.sent = usize::try_from(n).unwrap_or(usize::MAX),
            Err(err) => {
                // 配送済みだが記録できなかった分は次回 sweep で再配送される（at-least-once）
                error!(worker = %owner, count = succeeded.len(), error = %err, "failed to record sent messages");
                report.record_errors += 1;
            }
        }

        match self.record_failed(&failed).await {
            Ok(outcome) => {
                for id in &outcome.exhausted {
                    warn!(worker = %owner, message_id = %id, "delivery attempts exhausted; message terminally failed");
                }
                report.failed = outcome.len();
                report.exhausted = outcome.exhausted.len();
            }
            Err(err) => {
                error!(worker = %owner, count = failed.len(), error = %err, "failed to record failed deliveries");
                report.record_errors += 1;
            }
        }

        Ok(report)
    }

    async fn record_sent(&self, ids: &[MessageId]) -> Result<u64, StoreError> {
        let mut last_err = None;
        for _ in 0..RECORD_ATTEMPTS {
            match self.store.record_sent(&self.config.worker_id, ids).await {
                Ok(n) => return Ok(n),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Unavailable("record_sent not attempted".into())))
    }

    async fn record_failed(&self, ids: &[MessageId]) -> Result<FailureReport, StoreError> {
        let mut last_err = None;
        for _ in 0..RECORD_ATTEMPTS {
            match self.store.record_failed(&self.config.worker_id, ids).await {
                Ok(report) => return Ok(report),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Unavailable("record_failed not attempted".into())))
    }

    /// Sweep on a fixed cadence until shutdown is requested.
    ///
    /// A sweep that has started always runs to completion; shutdown only stops
    /// new sweeps from being scheduled. Dropping the sender also stops the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let owner = self.config.worker_id.clone();
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            worker = %owner,
            batch_size = self.config.batch_size,
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            "delivery worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // 次のループ先頭で判定
                    continue;
                }
                _ = ticker.tick() => {}
            }

            match self.sweep().await {
                Ok(report) if report.is_empty() => {}
                Ok(report) => info!(
                    worker = %owner,
                    claimed = report.claimed,
                    sent = report.sent,
                    failed = report.failed,
                    exhausted = report.exhausted,
                    record_errors = report.record_errors,
                    "sweep finished"
                ),
                Err(err) => error!(worker = %owner, error = %err, "sweep skipped: claim failed"),
            }
        }

        info!(worker = %owner, "delivery worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MessageRecord, Payload};
    use crate::impls::RecordingTransport;
    use crate::observability::QueueCounts;
    use crate::queue::{InMemoryMessageStore, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// In-memory store that fails the next N calls of selected operations.
    struct FlakyStore {
        inner: InMemoryMessageStore,
        claim_failures: AtomicUsize,
        record_sent_failures: AtomicUsize,
        record_failed_failures: AtomicUsize,
        record_sent_calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryMessageStore::new(RetryPolicy::default()),
                claim_failures: AtomicUsize::new(0),
                record_sent_failures: AtomicUsize::new(0),
                record_failed_failures: AtomicUsize::new(0),
                record_sent_calls: AtomicUsize::new(0),
            }
        }

        fn fail_next(counter: &AtomicUsize, n: usize) {
            counter.store(n, Ordering::SeqCst);
        }

        fn injected(counter: &AtomicUsize) -> Result<(), StoreError> {
            match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
                Ok(_) => Err(StoreError::Unavailable("connection reset".into())),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn enqueue(&self, payload: Payload) -> Result<MessageId, StoreError> {
            self.inner.enqueue(payload).await
        }

        async fn count_owned_by(&self, owner: &WorkerId) -> Result<usize, StoreError> {
            Self::injected(&self.claim_failures)?;
            self.inner.count_owned_by(owner).await
        }

        async fn claim_unowned(
            &self,
            owner: &WorkerId,
            limit: usize,
        ) -> Result<Vec<MessageId>, StoreError> {
            self.inner.claim_unowned(owner, limit).await
        }

        async fn fetch_owned_by(
            &self,
            owner: &WorkerId,
            limit: usize,
        ) -> Result<Vec<MessageRecord>, StoreError> {
            self.inner.fetch_owned_by(owner, limit).await
        }

        async fn record_sent(&self, owner: &WorkerId, ids: &[MessageId]) -> Result<u64, StoreError> {
            self.record_sent_calls.fetch_add(1, Ordering::SeqCst);
            Self::injected(&self.record_sent_failures)?;
            self.inner.record_sent(owner, ids).await
        }

        async fn record_failed(
            &self,
            owner: &WorkerId,
            ids: &[MessageId],
        ) -> Result<FailureReport, StoreError> {
            Self::injected(&self.record_failed_failures)?;
            self.inner.record_failed(owner, ids).await
        }

        async fn get(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
            self.inner.get(id).await
        }

        async fn release_owned_by(&self, owner: &WorkerId) -> Result<u64, StoreError> {
            self.inner.release_owned_by(owner).await
        }

        async fn counts(&self) -> Result<QueueCounts, StoreError> {
            self.inner.counts().await
        }
    }

    fn flaky_worker(store: Arc<FlakyStore>, transport: Arc<RecordingTransport>) -> DeliveryWorker {
        let config = WorkerConfig::new("w1").with_sweep_interval(Duration::from_millis(10));
        DeliveryWorker::new(config, store, transport).unwrap()
    }

    fn payload() -> Payload {
        Payload::text("noreply@example.com", "user@example.com", "hi", "hello")
    }

    fn worker(
        store: Arc<InMemoryMessageStore>,
        transport: Arc<RecordingTransport>,
        batch_size: usize,
    ) -> DeliveryWorker {
        let config = WorkerConfig::new("w1")
            .with_batch_size(batch_size)
            .with_sweep_interval(Duration::from_millis(10));
        DeliveryWorker::new(config, store, transport).unwrap()
    }

    #[tokio::test]
    async fn empty_sweep_is_a_no_op() {
        let store = Arc::new(InMemoryMessageStore::new(RetryPolicy::default()));
        let transport = Arc::new(RecordingTransport::succeeding());
        let report = worker(store, transport.clone(), 10).sweep().await.unwrap();

        assert!(report.is_empty());
        assert_eq!(transport.total_deliveries().await, 0);
    }

    #[tokio::test]
    async fn successful_sweep_marks_sent() {
        let store = Arc::new(InMemoryMessageStore::new(RetryPolicy::default()));
        let transport = Arc::new(RecordingTransport::succeeding());
        let id = store.enqueue(payload()).await.unwrap();

        let report = worker(store.clone(), transport.clone(), 10).sweep().await.unwrap();

        assert_eq!(report, SweepReport { claimed: 1, sent: 1, ..SweepReport::default() });
        let record = store.get(id).await.unwrap().unwrap();
        assert!(record.sent_at.is_some());
        assert!(record.owner.is_none());
        assert_eq!(transport.deliveries_of(id).await, 1);
    }

    #[tokio::test]
    async fn sweep_handles_at_most_batch_size() {
        let store = Arc::new(InMemoryMessageStore::new(RetryPolicy::default()));
        let transport = Arc::new(RecordingTransport::succeeding());
        for _ in 0..5 {
            store.enqueue(payload()).await.unwrap();
        }

        let report = worker(store.clone(), transport.clone(), 2).sweep().await.unwrap();

        assert_eq!(report.claimed, 2);
        assert_eq!(store.counts().await.unwrap().sent, 2);
        assert_eq!(store.counts().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn failing_message_is_terminal_after_max_attempts() {
        let store = Arc::new(InMemoryMessageStore::new(RetryPolicy::new(3).unwrap()));
        let transport = Arc::new(RecordingTransport::failing());
        let id = store.enqueue(payload()).await.unwrap();
        let worker = worker(store.clone(), transport.clone(), 10);

        for _ in 0..2 {
            let report = worker.sweep().await.unwrap();
            assert_eq!((report.failed, report.exhausted), (1, 0));
        }
        let report = worker.sweep().await.unwrap();
        assert_eq!((report.failed, report.exhausted), (1, 1));

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 3);
        assert!(record.terminally_failed);

        // 4 回目の sweep は claim しない
        assert!(worker.sweep().await.unwrap().is_empty());
        assert_eq!(transport.deliveries_of(id).await, 3);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let store = Arc::new(InMemoryMessageStore::new(RetryPolicy::new(3).unwrap()));
        let transport = Arc::new(RecordingTransport::failing_first(1));
        let id = store.enqueue(payload()).await.unwrap();
        let worker = worker(store.clone(), transport.clone(), 10);

        assert_eq!(worker.sweep().await.unwrap().failed, 1);
        assert_eq!(worker.sweep().await.unwrap().sent, 1);

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 1);
        assert!(record.sent_at.is_some());
        assert!(!record.terminally_failed);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(InMemoryMessageStore::new(RetryPolicy::default()));
        let transport = Arc::new(RecordingTransport::succeeding());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(worker(store, transport, 10).run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn single_record_failure_is_absorbed_by_retry() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(RecordingTransport::succeeding());
        let id = store.enqueue(payload()).await.unwrap();
        FlakyStore::fail_next(&store.record_sent_failures, 1);

        let report = flaky_worker(store.clone(), transport).sweep().await.unwrap();

        assert_eq!(report, SweepReport { claimed: 1, sent: 1, ..SweepReport::default() });
        assert_eq!(store.record_sent_calls.load(Ordering::SeqCst), RECORD_ATTEMPTS);
        assert!(store.get(id).await.unwrap().unwrap().sent_at.is_some());
    }

    #[tokio::test]
    async fn lost_record_sent_is_redelivered_next_sweep() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(RecordingTransport::succeeding());
        let id = store.enqueue(payload()).await.unwrap();
        let worker = flaky_worker(store.clone(), transport.clone());
        FlakyStore::fail_next(&store.record_sent_failures, RECORD_ATTEMPTS);

        let first = worker.sweep().await.unwrap();
        assert_eq!(
            first,
            SweepReport { claimed: 1, record_errors: 1, ..SweepReport::default() }
        );
        // 記録できなかったので claim は保持されたまま
        let record = store.get(id).await.unwrap().unwrap();
        assert!(record.is_pending());
        assert!(record.is_owned_by(worker.worker_id()));

        let second = worker.sweep().await.unwrap();
        assert_eq!(second, SweepReport { claimed: 1, sent: 1, ..SweepReport::default() });
        assert_eq!(transport.deliveries_of(id).await, 2);
        assert!(store.get(id).await.unwrap().unwrap().sent_at.is_some());
    }

    #[tokio::test]
    async fn lost_record_failed_leaves_attempts_unchanged() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(RecordingTransport::failing());
        let id = store.enqueue(payload()).await.unwrap();
        FlakyStore::fail_next(&store.record_failed_failures, RECORD_ATTEMPTS);

        let report = flaky_worker(store.clone(), transport).sweep().await.unwrap();

        assert_eq!(
            report,
            SweepReport { claimed: 1, record_errors: 1, ..SweepReport::default() }
        );
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.failed_attempts, 0);
        assert!(record.owner.is_some());
    }

    #[tokio::test]
    async fn claim_error_fails_the_sweep_without_delivering() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(RecordingTransport::succeeding());
        store.enqueue(payload()).await.unwrap();
        FlakyStore::fail_next(&store.claim_failures, 1);

        let result = flaky_worker(store.clone(), transport.clone()).sweep().await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(transport.total_deliveries().await, 0);
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn run_keeps_sweeping_after_claim_errors() {
        let store = Arc::new(FlakyStore::new());
        let transport = Arc::new(RecordingTransport::succeeding());
        let id = store.enqueue(payload()).await.unwrap();
        FlakyStore::fail_next(&store.claim_failures, 3);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(flaky_worker(store.clone(), transport.clone()).run(rx));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while store.get(id).await.unwrap().unwrap().sent_at.is_none() {
            assert!(tokio::time::Instant::now() < deadline, "message was never sent");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.claim_failures.load(Ordering::SeqCst), 0);
        assert_eq!(transport.deliveries_of(id).await, 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let store = Arc::new(InMemoryMessageStore::new(RetryPolicy::default()));
        let transport = Arc::new(RecordingTransport::succeeding());
        let config = WorkerConfig::new("w1").with_batch_size(0);
        assert!(matches!(
            DeliveryWorker::new(config, store, transport),
            Err(ConfigError::ZeroBatchSize)
        ));
    }
}
