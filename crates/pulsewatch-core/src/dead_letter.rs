use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::error::StoreError;
use crate::models::{ProbeJob, ResultRecord};

/// One batch that could not be written to the durable store after the
/// writer's retriable attempts were exhausted. Spilled as one line of
/// newline-delimited JSON under `dead_letter_spill_path` (§9.1: the spill
/// format decision), and replayed in file order at the next successful
/// store reconnect. Grounded on the teacher's in-memory `DeadLetterQueue`
/// (`jobs/dead_letter.rs`), adapted here to an on-disk spill since §4.9
/// requires the batch to survive process restarts, not just live in memory.
/// `jobs` carries each job's full `retry_history`, so the batch itself
/// doesn't need a separate retry-history field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterBatch {
    pub results: Vec<ResultRecord>,
    pub jobs: Vec<ProbeJob>,
    pub final_error: String,
    pub created_at: DateTime<Utc>,
}

pub struct DeadLetterSpill {
    path: PathBuf,
}

impl DeadLetterSpill {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub async fn append(&self, batch: &DeadLetterBatch) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let line = serde_json::to_string(batch)?;
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        Ok(())
    }

    /// Reads every spilled batch in file order. Does not remove the file —
    /// callers should call `truncate` only after every batch has been
    /// successfully replayed into the store.
    pub async fn read_all(&self) -> Result<Vec<DeadLetterBatch>, StoreError> {
        if !Path::new(&self.path).exists() {
            return Ok(Vec::new());
        }
        let file = tokio::fs::File::open(&self.path).await?;
        let mut lines = tokio::io::BufReader::new(file).lines();
        let mut batches = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            batches.push(serde_json::from_str(&line)?);
        }
        Ok(batches)
    }

    pub async fn truncate(&self) -> Result<(), StoreError> {
        if Path::new(&self.path).exists() {
            tokio::fs::File::create(&self.path).await?;
        }
        Ok(())
    }
}
