//! Errors - エラー型と分類
//!
//! - `StoreError`: ストレージ障害（接続断・タイムアウトなど）。ワーカーはログに残して次の tick で再試行
//! - `DeliveryError`: transport が配送に失敗。`record_failed` の対象になる
//! - `ConfigError`: 起動時の設定エラー（Fail-fast）

use thiserror::Error;

use super::ids::MessageId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row for message {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("message not found: {0}")]
    NotFound(MessageId),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport rejected message: {0}")]
    Rejected(String),

    #[error("transport i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("worker id must not be empty")]
    EmptyWorkerId,

    #[error("batch size must be at least 1")]
    ZeroBatchSize,

    #[error("sweep interval must be greater than zero")]
    ZeroSweepInterval,

    #[error("max attempts must be at least 1")]
    ZeroMaxAttempts,

    #[error("lease timeout must be greater than zero")]
    ZeroLeaseTimeout,

    #[error("duplicate worker id: {0}")]
    DuplicateWorkerId(String),
}
