//! Cohort processing seam: the orchestrator hands each cohort to a
//! processor and relays what it reports.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::events::DocumentStatus;
use crate::models::{BatchId, IntakeFile, Strategy};
use crate::pipeline::detection::ClassificationResult;
use crate::pipeline::ledger::{BatchLedger, LedgerError};

#[derive(Error, Debug)]
pub enum CohortError {
    #[error("Processing {filename} failed: {reason}")]
    Processing { filename: String, reason: String },

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// An intake file with its final routing decision.
#[derive(Debug, Clone)]
pub struct ClassifiedFile {
    pub file: IntakeFile,
    pub result: ClassificationResult,
}

impl ClassifiedFile {
    pub fn strategy(&self) -> Strategy {
        self.result.strategy
    }

    pub fn filename(&self) -> String {
        self.file.filename()
    }
}

/// Fine-grained progress from a cohort processor.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortEvent {
    pub filename: String,
    pub status: DocumentStatus,
    /// Documents finished so far within this cohort.
    pub documents_completed: usize,
    pub batch_id: BatchId,
    pub message: Option<String>,
}

pub type CohortEvents<'a> = Box<dyn Iterator<Item = Result<CohortEvent, CohortError>> + Send + 'a>;

/// Processes one cohort into one batch, yielding events lazily.
///
/// Work happens as the iterator is pulled; an `Err` item ends the run. A
/// document that fails on its own should be reported as a
/// [`DocumentStatus::Failed`] event instead.
pub trait CohortProcessor: Send + Sync {
    fn process<'a>(
        &'a self,
        cohort: Strategy,
        files: Vec<ClassifiedFile>,
        batch_id: BatchId,
        cancel: CancellationToken,
    ) -> Result<CohortEvents<'a>, CohortError>;
}

/// Registers every file of a cohort as a document of its batch.
pub struct LedgerRecorder {
    ledger: BatchLedger,
}

impl LedgerRecorder {
    pub fn new(ledger: BatchLedger) -> Self {
        Self { ledger }
    }
}

impl CohortProcessor for LedgerRecorder {
    fn process<'a>(
        &'a self,
        cohort: Strategy,
        files: Vec<ClassifiedFile>,
        batch_id: BatchId,
        cancel: CancellationToken,
    ) -> Result<CohortEvents<'a>, CohortError> {
        tracing::debug!(%cohort, batch_id, files = files.len(), "Recording cohort");

        let events = files
            .into_iter()
            .take_while(move |_| !cancel.is_cancelled())
            .enumerate()
            .map(move |(index, classified)| -> Result<CohortEvent, CohortError> {
                let filename = classified.filename();
                self.ledger.record_document(batch_id, &filename)?;
                Ok(CohortEvent {
                    filename,
                    status: DocumentStatus::Completed,
                    documents_completed: index + 1,
                    batch_id,
                    message: None,
                })
            });
        Ok(Box::new(events))
    }
}
