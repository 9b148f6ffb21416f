//! Status views and tracing setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Per-state message counts for operator dashboards.
///
/// `pending` and `claimed` are both logically pending; they differ only in
/// whether some worker currently holds the message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub claimed: usize,
    pub sent: usize,
    pub terminally_failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.sent + self.terminally_failed
    }

    /// Nothing left to attempt.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.claimed == 0
    }
}

/// Install the process-wide tracing subscriber.
///
/// Filter comes from `RUST_LOG` (default `info`). Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
