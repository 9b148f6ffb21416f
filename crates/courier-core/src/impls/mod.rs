//! Impls - port の実装（transport）
//!
//! ストア実装は `queue` モジュール側にある。

pub mod recording;
pub mod transport;

pub use self::recording::RecordingTransport;
pub use self::transport::{LogTransport, SpoolTransport};
