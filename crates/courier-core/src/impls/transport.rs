//! Transports shipped with the CLI.
//!
//! - `LogTransport`: logs each message and accepts it. Dry-run / development.
//! - `SpoolTransport`: appends each message as one JSON line to
//!   `<dir>/<recipient>.jsonl`; a relay process can pick the files up.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::domain::{DeliveryError, MessageRecord};
use crate::ports::Transport;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, message: &MessageRecord) -> Result<(), DeliveryError> {
        info!(
            message_id = %message.id,
            from = %message.payload.from,
            to = %message.payload.to,
            subject = %message.payload.subject,
            "delivered (log transport)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SpoolTransport {
    dir: PathBuf,
}

impl SpoolTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn spool_file(&self, recipient: &str) -> Result<PathBuf, DeliveryError> {
        let mut name: String = recipient
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "@.-_+".contains(c) { c } else { '_' })
            .collect();
        if name.is_empty() {
            return Err(DeliveryError::Rejected(format!("unusable recipient: {recipient:?}")));
        }
        if name.starts_with('.') {
            name.insert(0, '_');
        }
        Ok(self.dir.join(format!("{name}.jsonl")))
    }
}

#[async_trait]
impl Transport for SpoolTransport {
    async fn deliver(&self, message: &MessageRecord) -> Result<(), DeliveryError> {
        let path = self.spool_file(&message.payload.to)?;
        let mut line = serde_json::to_vec(&serde_json::json!({
            "id": message.id.to_string(),
            "payload": message.payload,
        }))?;
        line.push(b'\n');

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
