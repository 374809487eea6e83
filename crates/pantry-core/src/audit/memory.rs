//! In-process audit sink.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AuditError, AuditReceipt, AuditRecord, AuditSink};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAuditEntry {
    #[serde(flatten)]
    pub receipt: AuditReceipt,
    pub record: AuditRecord,
}

/// Records kept by [`MemoryAuditSink::new`] before the oldest are dropped.
pub const DEFAULT_AUDIT_RETENTION: usize = 10_000;

/// Keeps the most recent records in memory, in write order.
#[derive(Clone)]
pub struct MemoryAuditSink {
    entries: Arc<Mutex<VecDeque<StoredAuditEntry>>>,
    failing: Arc<AtomicBool>,
    retention: usize,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::with_retention(DEFAULT_AUDIT_RETENTION)
    }
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retention` records (at least one); older ones are evicted.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::new())),
            failing: Arc::new(AtomicBool::new(false)),
            retention: retention.max(1),
        }
    }

    #[must_use]
    pub const fn retention(&self) -> usize {
        self.retention
    }

    /// Reject every write while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub async fn entries(&self) -> Vec<StoredAuditEntry> {
        self.entries.lock().await.iter().cloned().collect()
    }

    pub async fn entries_for(&self, operation_id: &str) -> Vec<StoredAuditEntry> {
        self.entries
            .lock()
            .await
            .iter()
            .filter(|entry| entry.record.operation_id() == Some(operation_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log_batch_operation(&self, record: &AuditRecord) -> Result<AuditReceipt, AuditError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(AuditError::Unavailable(
                "memory audit sink marked failing".to_string(),
            ));
        }
        if record.operation_id().is_none() {
            return Err(AuditError::Rejected(
                "metadata.operationId is required".to_string(),
            ));
        }

        let receipt = AuditReceipt {
            id: Uuid::now_v7().to_string(),
            timestamp: Utc::now(),
        };
        let mut entries = self.entries.lock().await;
        while entries.len() >= self.retention {
            if let Some(evicted) = entries.pop_front() {
                tracing::debug!(receipt_id = %evicted.receipt.id, "Evicted oldest audit record");
            }
        }
        entries.push_back(StoredAuditEntry {
            receipt: receipt.clone(),
            record: record.clone(),
        });
        Ok(receipt)
    }
}
