//! Transport port - 実際の配送（SMTP リレーなど）を担う外部コラボレータ
//!
//! プロトコル・接続・認証はすべて実装側の責務。キューは成功/失敗しか見ない。

use async_trait::async_trait;

use crate::domain::{DeliveryError, MessageRecord};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message. Any `Err` counts as one failed attempt.
    async fn deliver(&self, message: &MessageRecord) -> Result<(), DeliveryError>;
}
