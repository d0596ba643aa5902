use serde::{Deserialize, Serialize};

use super::enums::BatchStatus;

/// Integer ids: a lower id was inserted earlier.
pub type BatchId = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub status: BatchStatus,
    pub has_been_manipulated: bool,
    /// `None` on schemas without a creation timestamp column.
    pub created_at: Option<String>,
}
