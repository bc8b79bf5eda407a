//! Optional durable history of routed messages.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::debug;

use crate::{codec, error::StorageError, message::Message};

/// Write sink for accepted messages.
///
/// The router calls [`HistorySink::record`] after fanout and only logs
/// failures, so a broken sink never stops messages from being delivered.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, message: &Message) -> Result<(), StorageError>;

    /// Most recent messages, oldest first. Sinks that cannot read back
    /// return nothing.
    async fn recent(&self, _limit: usize) -> Result<Vec<Message>, StorageError> {
        Ok(Vec::new())
    }

    /// Highest message id recorded so far.
    async fn latest_id(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.recent(1).await?.last().map(Message::id))
    }
}

/// Appends one JSON record per line to a file.
pub struct FileHistory {
    path: PathBuf,
    // Serializes appends so concurrent records never interleave.
    write_lock: Mutex<()>,
}

impl FileHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistorySink for FileHistory {
    async fn record(&self, message: &Message) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Message>, StorageError> {
        let mut messages = self.read_all().await?;
        let skip = messages.len().saturating_sub(limit);
        messages.drain(..skip);
        Ok(messages)
    }

    /// Scans the whole file, since lines written by an older relay may not
    /// be in id order.
    async fn latest_id(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.read_all().await?.iter().map(Message::id).max())
    }
}

impl FileHistory {
    async fn read_all(&self) -> Result<Vec<Message>, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match codec::decode(line.as_bytes()) {
                Ok(message) => Some(message),
                Err(err) => {
                    debug!(error = %err, "skipping unreadable history line");
                    None
                }
            })
            .collect())
    }
}
