//! RecordingTransport - テスト用の transport
//!
//! Counts every `deliver` call per message id and fails according to a fixed
//! plan. Used by the contention tests to prove no message is delivered twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{DeliveryError, MessageId, MessageRecord};
use crate::ports::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePlan {
    Never,
    Always,
    /// Fail the first `n` calls across all messages, then succeed.
    FirstCalls(usize),
}

pub struct RecordingTransport {
    plan: FailurePlan,
    calls: AtomicUsize,
    deliveries: Mutex<HashMap<MessageId, usize>>,
}

impl RecordingTransport {
    fn with_plan(plan: FailurePlan) -> Self {
        Self {
            plan,
            calls: AtomicUsize::new(0),
            deliveries: Mutex::new(HashMap::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_plan(FailurePlan::Never)
    }

    pub fn failing() -> Self {
        Self::with_plan(FailurePlan::Always)
    }

    pub fn failing_first(n: usize) -> Self {
        Self::with_plan(FailurePlan::FirstCalls(n))
    }

    /// `deliver` calls made for `id` (failed ones included).
    pub async fn deliveries_of(&self, id: MessageId) -> usize {
        self.deliveries.lock().await.get(&id).copied().unwrap_or(0)
    }

    pub async fn total_deliveries(&self) -> usize {
        self.deliveries.lock().await.values().sum()
    }

    pub async fn snapshot(&self) -> HashMap<MessageId, usize> {
        self.deliveries.lock().await.clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, message: &MessageRecord) -> Result<(), DeliveryError> {
        *self.deliveries.lock().await.entry(message.id).or_insert(0) += 1;

        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = match self.plan {
            FailurePlan::Never => false,
            FailurePlan::Always => true,
            FailurePlan::FirstCalls(n) => call < n,
        };
        if fail {
            return Err(DeliveryError::Rejected(format!("planned failure #{}", call + 1)));
        }
        Ok(())
    }
}
