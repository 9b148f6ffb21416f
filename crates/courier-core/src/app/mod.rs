//! App - アプリケーション層
//!
//! ports を組み合わせて配送ロジックを実装する。
//!
//! # 主要コンポーネント
//! - **claim_batch**: 持ち越し分 + 不足分の claim でバッチを確保
//! - **DeliveryWorker**: claim → deliver → record を一定間隔で繰り返す
//! - **WorkerGroup**: 複数ワーカーの起動と協調的シャットダウン

pub mod claim;
pub mod worker_group;
pub mod worker_loop;

pub use self::claim::claim_batch;
pub use self::worker_group::WorkerGroup;
pub use self::worker_loop::{DeliveryWorker, SweepReport};
