use serde::{Deserialize, Serialize};

use crate::models::BatchId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyzing,
    SingleDocuments,
    BatchScans,
    Complete,
    Cancelled,
    Error,
    Heartbeat,
}

/// Per-document outcome reported by a cohort processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Processing,
    Completed,
    Failed,
    Skipped,
}

/// One unit of a run's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub progress: usize,
    pub total: usize,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_status: Option<DocumentStatus>,
    #[serde(default)]
    pub complete: bool,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_scan_batch_id: Option<BatchId>,
    #[serde(default)]
    pub heartbeat: bool,
}

impl ProgressEvent {
    pub fn new(phase: Phase, progress: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            phase,
            progress,
            total,
            message: message.into(),
            current_file: None,
            document_status: None,
            complete: false,
            cancelled: false,
            error: None,
            single_batch_id: None,
            batch_scan_batch_id: None,
            heartbeat: false,
        }
    }

    /// Keep-alive for a stream that has been silent; carries the last known counts.
    pub fn heartbeat(progress: usize, total: usize) -> Self {
        Self {
            heartbeat: true,
            ..Self::new(Phase::Heartbeat, progress, total, "Still working")
        }
    }

    pub fn with_file(mut self, filename: impl Into<String>, status: DocumentStatus) -> Self {
        self.current_file = Some(filename.into());
        self.document_status = Some(status);
        self
    }

    pub fn with_batches(mut self, single: Option<BatchId>, batch_scan: Option<BatchId>) -> Self {
        self.single_batch_id = single;
        self.batch_scan_batch_id = batch_scan;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.complete || self.cancelled || self.error.is_some()
    }
}
