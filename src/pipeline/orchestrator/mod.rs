//! Phased orchestration of an intake run: classify, split into cohorts,
//! process single documents then batch scans, and report progress.

pub mod events;
pub mod cache;
pub mod cohort;
pub mod runner;

pub use events::{DocumentStatus, Phase, ProgressEvent};
pub use cache::ClassificationCache;
pub use cohort::{ClassifiedFile, CohortError, CohortEvent, CohortEvents, CohortProcessor, LedgerRecorder};
pub use runner::{
    BatchClaimer, LedgerClaimer, Overrides, RunOutcome, RunRequest, RunSummary, SmartOrchestrator,
    MAX_LEDGER_RETRIES,
};

use thiserror::Error;

use crate::models::Strategy;
use crate::pipeline::ledger::LedgerError;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("No batch available for {cohort}: {source}")]
    NoBatch {
        cohort: Strategy,
        source: LedgerError,
    },

    #[error(transparent)]
    Cohort(#[from] CohortError),
}
