//! Back-office outbox.
//!
//! Escalations are appended to a JSONL file that the back-office tooling
//! tails. Delivery is at-least-once; consumers dedupe on
//! `(requestId, round)`.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::domain::Escalation;

use super::{AdapterError, HitlChannel};

/// Append-only JSONL outbox of escalations
pub struct OutboxChannel {
    path: PathBuf,
}

impl OutboxChannel {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read back every published escalation, oldest first
    pub async fn read_all(&self) -> Result<Vec<Escalation>, AdapterError> {
        let mut escalations = Vec::new();
        if !self.path.exists() {
            return Ok(escalations);
        }

        let file = File::open(&self.path).await.map_err(io_error)?;
        let mut lines = BufReader::new(file).lines();

        while let Some(line) = lines.next_line().await.map_err(io_error)? {
            if line.trim().is_empty() {
                continue;
            }
            let escalation = serde_json::from_str(&line)
                .map_err(|e| AdapterError::Fatal(format!("corrupt outbox line: {}", e)))?;
            escalations.push(escalation);
        }

        Ok(escalations)
    }
}

fn io_error(err: std::io::Error) -> AdapterError {
    AdapterError::Transient(err.to_string())
}

#[async_trait]
impl HitlChannel for OutboxChannel {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn publish(&self, escalation: &Escalation) -> Result<(), AdapterError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io_error)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_error)?;

        let json = serde_json::to_string(escalation)
            .map_err(|e| AdapterError::Fatal(e.to_string()))?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .map_err(io_error)?;
        file.flush().await.map_err(io_error)?;

        Ok(())
    }
}
