use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use super::worker_loop::DeliveryWorker;
use crate::config::{WorkerConfig, validate_all};
use crate::domain::{ConfigError, WorkerId};
use crate::ports::{MessageStore, Transport};

/// Worker group handle.
/// - 各ワーカーは独立した timer ループ（ワーカー間の同期は一切なし、調整はストア経由のみ）
/// - `shutdown_tx` を drop するとワーカー全体が止まる
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<(WorkerId, JoinHandle<()>)>,
}

impl WorkerGroup {
    /// Spawn one task per config. Identities must be distinct.
    pub fn spawn(
        configs: Vec<WorkerConfig>,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        validate_all(&configs)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(configs.len());
        for config in configs {
            let worker = DeliveryWorker::new(config, Arc::clone(&store), Arc::clone(&transport))?;
            let worker_id = worker.worker_id().clone();
            let join = tokio::spawn(worker.run(shutdown_rx.clone()));
            joins.push((worker_id, join));
        }

        Ok(Self { shutdown_tx, joins })
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all workers.
    /// In-flight sweeps are not cancelled; workers just stop scheduling new ones.
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for (worker_id, join) in self.joins {
            if let Err(err) = join.await {
                warn!(worker = %worker_id, error = %err, "worker task ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::RecordingTransport;
    use crate::queue::{InMemoryMessageStore, RetryPolicy};
    use std::time::Duration;

    #[tokio::test]
    async fn spawns_and_stops_all_workers() {
        let store = Arc::new(InMemoryMessageStore::new(RetryPolicy::default()));
        let transport = Arc::new(RecordingTransport::succeeding());
        let template = WorkerConfig::new("unused").with_sweep_interval(Duration::from_millis(10));

        let group = WorkerGroup::spawn(WorkerConfig::numbered("w", 3, &template), store, transport)
            .unwrap();
        assert_eq!(group.len(), 3);
        let ids: Vec<_> = group.joins.iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(ids, vec!["w-0", "w-1", "w-2"]);

        tokio::time::timeout(Duration::from_secs(1), group.shutdown_and_join())
            .await
            .expect("workers did not stop");
    }

    #[tokio::test]
    async fn duplicate_identities_are_refused() {
        let store = Arc::new(InMemoryMessageStore::new(RetryPolicy::default()));
        let transport = Arc::new(RecordingTransport::succeeding());
        let configs = vec![WorkerConfig::new("same"), WorkerConfig::new("same")];

        assert!(matches!(
            WorkerGroup::spawn(configs, store, transport),
            Err(ConfigError::DuplicateWorkerId(_))
        ));
    }
}
