//! Divergence records and the sinks that receive them.
//!
//! A [`DivergenceRecord`] is produced when two or more models answered an
//! operation and their stringified outputs were not all identical. Recording
//! is fire-and-forget: a sink failure is logged and dropped, it never fails
//! the consensus round that produced the record.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::diff::DiffSummary;
use crate::errors::{CoordinationError, CoordinationResult};

/// Stringified output of one successful model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub model_name: String,
    pub output: String,
}

/// Models whose outputs stringified to the same text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseGroup {
    pub output: String,
    /// Member models in dispatch order.
    pub models: Vec<String>,
    /// Dispatch sequence of the first member; groups are ordered by it.
    pub first_sequence: usize,
}

impl ResponseGroup {
    pub fn size(&self) -> usize {
        self.models.len()
    }
}

/// Disagreement between providers, kept for offline review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceRecord {
    pub id: String,
    pub operation_type: String,
    pub input: String,
    pub responses: Vec<ModelOutput>,
    pub groups: Vec<ResponseGroup>,
    /// Model whose response was returned to the caller.
    pub authoritative_model: String,
    /// Diff of the authoritative output against the first dissenting group.
    pub diff_summary: DiffSummary,
    /// Whether the largest group held strictly more than half the successes.
    pub strict_majority: bool,
    pub recorded_at: DateTime<Utc>,
}

impl DivergenceRecord {
    /// Serialize as a single JSON line.
    pub fn to_json_line(&self) -> CoordinationResult<String> {
        serde_json::to_string(self).map_err(|e| CoordinationError::Sink(e.to_string()))
    }
}

/// Host collaborator that stores divergence records.
#[async_trait]
pub trait DivergenceSink: Send + Sync {
    async fn record(&self, record: &DivergenceRecord) -> CoordinationResult<()>;
}

/// Drops every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDivergenceSink;

#[async_trait]
impl DivergenceSink for NullDivergenceSink {
    async fn record(&self, _record: &DivergenceRecord) -> CoordinationResult<()> {
        Ok(())
    }
}

/// Emits each record as a structured `warn!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDivergenceSink;

#[async_trait]
impl DivergenceSink for TracingDivergenceSink {
    async fn record(&self, record: &DivergenceRecord) -> CoordinationResult<()> {
        let groups: Vec<String> = record
            .groups
            .iter()
            .map(|g| format!("[{}]", g.models.join(", ")))
            .collect();
        warn!(
            id = %record.id,
            operation = %record.operation_type,
            authoritative = %record.authoritative_model,
            groups = %groups.join(" vs "),
            additions = record.diff_summary.additions,
            deletions = record.diff_summary.deletions,
            strict_majority = record.strict_majority,
            "model outputs diverged"
        );
        Ok(())
    }
}

/// Append-only JSON lines file, one record per line.
#[derive(Debug, Clone)]
pub struct JsonlDivergenceSink {
    path: PathBuf,
}

impl JsonlDivergenceSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record back, skipping lines that fail to parse.
    pub fn read_all(&self) -> CoordinationResult<Vec<DivergenceRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl DivergenceSink for JsonlDivergenceSink {
    async fn record(&self, record: &DivergenceRecord) -> CoordinationResult<()> {
        let mut line = record.to_json_line()?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps records in memory; useful for hosts that batch uploads.
#[derive(Debug, Default)]
pub struct MemoryDivergenceSink {
    records: Mutex<Vec<DivergenceRecord>>,
}

impl MemoryDivergenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DivergenceRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Remove and return everything recorded so far.
    pub fn drain(&self) -> Vec<DivergenceRecord> {
        std::mem::take(
            &mut *self
                .records
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

#[async_trait]
impl DivergenceSink for MemoryDivergenceSink {
    async fn record(&self, record: &DivergenceRecord) -> CoordinationResult<()> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}
