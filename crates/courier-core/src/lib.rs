//! courier-core
//!
//! Cluster-wide outbound message queue. Any number of worker processes drain a
//! shared backlog; each message is attempted by one worker at a time, survives
//! worker crashes, and is retried a bounded number of times.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, errors）
//! - **ports**: 抽象化レイヤー（MessageStore, Transport, Clock, IdGenerator）
//! - **queue**: ストア実装（InMemory, SQLite）と retry/lease ポリシー
//! - **app**: claim protocol, DeliveryWorker, WorkerGroup
//! - **impls**: transport 実装（log, spool, テスト用 recording）
//! - **config**: ワーカー設定
//! - **observability**: QueueCounts と tracing 初期化

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod queue;

pub use app::{DeliveryWorker, SweepReport, WorkerGroup};
pub use config::WorkerConfig;
pub use domain::{MessageId, MessageRecord, Payload, WorkerId};
pub use ports::{MessageStore, Transport};
