//! Ports - 抽象化レイヤー
//!
//! 外部システム（ストレージ、配送 transport、時刻、ID 採番）への
//! インターフェースを定義し、実装の詳細を隠蔽する。
//! ストレージはワーカー間の唯一の共有資源であり調整点。

pub mod clock;
pub mod id_generator;
pub mod message_store;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::message_store::{FailureReport, MessageStore};
pub use self::transport::Transport;
