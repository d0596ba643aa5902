//! Batch ledger: the only writer of batch rows and their lifecycle status.

pub mod retention;
pub mod store;

pub use retention::RetentionGuard;
pub use store::{AgeStrategy, BatchLedger};

use thiserror::Error;

use crate::db::DatabaseError;
use crate::models::BatchId;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Batch {0} not found")]
    NotFound(BatchId),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Database(DatabaseError::Sqlite(e))
    }
}
