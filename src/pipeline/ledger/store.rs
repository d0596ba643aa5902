//! SQLite-backed batch ledger.
//!
//! Every call opens its own connection, so concurrent callers (threads or
//! processes) genuinely race on the database file. Check-then-mutate
//! sequences run under a process-wide mutation lock and inside an
//! IMMEDIATE transaction; read-only queries take neither.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};

use super::retention::RetentionGuard;
use super::LedgerError;
use crate::config::EngineConfig;
use crate::db;
use crate::models::{Batch, BatchId, BatchStatus};

static MUTATION_LOCK: Mutex<()> = Mutex::new(());

fn mutation_lock() -> MutexGuard<'static, ()> {
    MUTATION_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How batch age is judged by [`BatchLedger::cleanup_empty_batches_policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgeStrategy {
    /// Compare `created_at` against the threshold.
    CreatedAt,
    /// Legacy schema without timestamps: anything older than the newest batch.
    IdOrder,
}

const EMPTY: &str = "NOT EXISTS (SELECT 1 FROM documents d WHERE d.batch_id = b.id)";

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

struct BatchRow {
    id: BatchId,
    status: String,
    has_been_manipulated: bool,
    created_at: Option<String>,
}

fn batch_from_row(row: BatchRow) -> Result<Batch, LedgerError> {
    Ok(Batch {
        id: row.id,
        status: row.status.parse::<BatchStatus>()?,
        has_been_manipulated: row.has_been_manipulated,
        created_at: row.created_at,
    })
}

#[derive(Debug, Clone)]
pub struct BatchLedger {
    db_path: PathBuf,
    retention: RetentionGuard,
    age_strategy: AgeStrategy,
}

impl BatchLedger {
    /// Open (creating if needed) the ledger database and probe its schema.
    pub fn open(db_path: impl Into<PathBuf>, retention: RetentionGuard) -> Result<Self, LedgerError> {
        let db_path = db_path.into();
        let conn = db::open_database(&db_path)?;
        let age_strategy = if db::table_has_column(&conn, "batches", "created_at")? {
            AgeStrategy::CreatedAt
        } else {
            tracing::warn!(path = %db_path.display(), "batches table has no created_at, age policy falls back to id order");
            AgeStrategy::IdOrder
        };

        tracing::info!(
            path = %db_path.display(),
            retention_guard = retention.is_enabled(),
            ?age_strategy,
            "Batch ledger opened"
        );

        Ok(Self {
            db_path,
            retention,
            age_strategy,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, LedgerError> {
        Self::open(&config.ledger_db, RetentionGuard::from_config(config))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn retention(&self) -> &RetentionGuard {
        &self.retention
    }

    pub fn supports_creation_timestamp(&self) -> bool {
        self.age_strategy == AgeStrategy::CreatedAt
    }

    pub fn age_strategy(&self) -> AgeStrategy {
        self.age_strategy
    }

    fn connect(&self) -> Result<Connection, LedgerError> {
        Ok(db::connect(&self.db_path)?)
    }

    // ═══════════════════════════════════════════════════════════
    // Resolution
    // ═══════════════════════════════════════════════════════════

    /// Most recent open intake batch, or a fresh one. Other empty intake
    /// batches are pruned afterwards, keeping the resolved batch and the most
    /// recent batch.
    pub fn get_or_create_intake_batch(&self) -> Result<BatchId, LedgerError> {
        let _guard = mutation_lock();
        let id = self.resolve_or_create(&BatchStatus::OPEN_INTAKE, BatchStatus::Intake)?;

        if let Err(e) = self.prune_empty_intake(id) {
            tracing::warn!(batch_id = id, error = %e, "Pruning empty intake batches failed");
        }
        Ok(id)
    }

    /// Most recent processing batch regardless of document count, or a fresh one.
    pub fn get_or_create_processing_batch(&self) -> Result<BatchId, LedgerError> {
        let _guard = mutation_lock();
        self.resolve_or_create(&[BatchStatus::Processing], BatchStatus::Processing)
    }

    pub fn create_new_batch(&self, status: BatchStatus) -> Result<BatchId, LedgerError> {
        let _guard = mutation_lock();
        let conn = self.connect()?;
        let id = insert_batch(&conn, status)?;
        tracing::info!(batch_id = id, status = %status, "Batch created");
        Ok(id)
    }

    fn resolve_or_create(
        &self,
        statuses: &[BatchStatus],
        create_as: BatchStatus,
    ) -> Result<BatchId, LedgerError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<BatchId> = tx
            .query_row(
                &format!(
                    "SELECT id FROM batches WHERE status IN ({}) ORDER BY id DESC LIMIT 1",
                    placeholders(statuses.len())
                ),
                params_from_iter(statuses.iter().map(|s| s.as_str())),
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                tracing::debug!(batch_id = id, status = %create_as, "Reusing open batch");
                id
            }
            None => {
                let id = insert_batch(&tx, create_as)?;
                tracing::info!(batch_id = id, status = %create_as, "Batch created");
                id
            }
        };

        tx.commit()?;
        Ok(id)
    }

    fn prune_empty_intake(&self, keep: BatchId) -> Result<usize, LedgerError> {
        let conn = self.connect()?;
        let statuses = BatchStatus::OPEN_INTAKE;
        let sql = format!(
            "DELETE FROM batches WHERE id IN (
                 SELECT b.id FROM batches b
                 WHERE b.status IN ({}) AND b.id != ? AND {EMPTY}
                   AND b.id != (SELECT MAX(id) FROM batches)
             )",
            placeholders(statuses.len())
        );
        let mut values: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        values.push(keep.to_string());

        let pruned = conn.execute(&sql, params_from_iter(values.iter()))?;
        if pruned > 0 {
            tracing::info!(kept = keep, pruned, "Pruned empty intake batches");
        }
        Ok(pruned)
    }

    // ═══════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════

    pub fn set_status(&self, id: BatchId, status: BatchStatus) -> Result<(), LedgerError> {
        let _guard = mutation_lock();
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE batches SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if updated == 0 {
            return Err(LedgerError::NotFound(id));
        }
        tracing::debug!(batch_id = id, status = %status, "Batch status set");
        Ok(())
    }

    pub fn mark_manipulated(&self, id: BatchId) -> Result<(), LedgerError> {
        let _guard = mutation_lock();
        let conn = self.connect()?;
        let updated = conn.execute(
            "UPDATE batches SET has_been_manipulated = 1 WHERE id = ?1",
            params![id],
        )?;
        if updated == 0 {
            return Err(LedgerError::NotFound(id));
        }
        Ok(())
    }

    /// Attach a document to a batch; returns the document row id.
    pub fn record_document(&self, id: BatchId, original_filename: &str) -> Result<i64, LedgerError> {
        let _guard = mutation_lock();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !exists(&tx, id)? {
            return Err(LedgerError::NotFound(id));
        }
        tx.execute(
            "INSERT INTO documents (batch_id, original_filename) VALUES (?1, ?2)",
            params![id, original_filename],
        )?;
        let doc_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(doc_id)
    }

    // ═══════════════════════════════════════════════════════════
    // Cleanup
    // ═══════════════════════════════════════════════════════════

    /// Delete empty processing batches. With the retention guard on, only
    /// batches that have a backup are deleted.
    pub fn cleanup_empty_processing_batches(&self) -> Result<Vec<BatchId>, LedgerError> {
        let _guard = mutation_lock();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates = empty_batch_ids(&tx, &[BatchStatus::Processing], None)?;
        let mut deleted = Vec::new();
        for id in candidates {
            if !self.retention.allows_delete(id) {
                tracing::debug!(batch_id = id, backup = %self.retention.backup_dir(id).display(), "No backup, keeping empty batch");
                continue;
            }
            tx.execute("DELETE FROM batches WHERE id = ?1", params![id])?;
            deleted.push(id);
        }
        tx.commit()?;

        if !deleted.is_empty() {
            tracing::info!(count = deleted.len(), ?deleted, "Deleted empty processing batches");
        }
        Ok(deleted)
    }

    /// Mark empty processing batches as orphaned.
    pub fn mark_orphaned_empty_batches(&self) -> Result<Vec<BatchId>, LedgerError> {
        let _guard = mutation_lock();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids = empty_batch_ids(&tx, &[BatchStatus::Processing], None)?;
        for id in &ids {
            tx.execute(
                "UPDATE batches SET status = ?1 WHERE id = ?2",
                params![BatchStatus::Orphaned.as_str(), id],
            )?;
        }
        tx.commit()?;

        if !ids.is_empty() {
            tracing::info!(count = ids.len(), ?ids, "Orphaned empty processing batches");
        }
        Ok(ids)
    }

    /// Delete empty batches in `statuses` older than `age_minutes`.
    ///
    /// Without a `created_at` column the threshold cannot be evaluated; a
    /// batch counts as old once a newer batch with the same status exists, so
    /// the newest batch of each status always survives.
    pub fn cleanup_empty_batches_policy(
        &self,
        age_minutes: u32,
        statuses: &[BatchStatus],
    ) -> Result<Vec<BatchId>, LedgerError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = mutation_lock();
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ids = match self.age_strategy {
            AgeStrategy::CreatedAt => empty_batch_ids(
                &tx,
                statuses,
                Some(AgeFilter::OlderThanMinutes(age_minutes)),
            )?,
            AgeStrategy::IdOrder => empty_batch_ids(&tx, statuses, Some(AgeFilter::SupersededInStatus))?,
        };
        for id in &ids {
            tx.execute("DELETE FROM batches WHERE id = ?1", params![id])?;
        }
        tx.commit()?;

        tracing::info!(
            count = ids.len(),
            age_minutes,
            strategy = ?self.age_strategy,
            "Age-policy cleanup finished"
        );
        Ok(ids)
    }

    // ═══════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════

    pub fn get_batch(&self, id: BatchId) -> Result<Option<Batch>, LedgerError> {
        let conn = self.connect()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT id, status, has_been_manipulated, {} FROM batches WHERE id = ?1",
                    self.created_at_column()
                ),
                params![id],
                read_batch_row,
            )
            .optional()?;
        row.map(batch_from_row).transpose()
    }

    pub fn batch_exists(&self, id: BatchId) -> Result<bool, LedgerError> {
        let conn = self.connect()?;
        exists(&conn, id)
    }

    pub fn document_count(&self, id: BatchId) -> Result<u64, LedgerError> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE batch_id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// All batches, oldest first.
    pub fn list_batches(&self) -> Result<Vec<Batch>, LedgerError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT id, status, has_been_manipulated, {} FROM batches ORDER BY id ASC",
            self.created_at_column()
        ))?;
        let rows = stmt.query_map([], read_batch_row)?;

        let mut batches = Vec::new();
        for row in rows {
            batches.push(batch_from_row(row?)?);
        }
        Ok(batches)
    }

    fn created_at_column(&self) -> &'static str {
        match self.age_strategy {
            AgeStrategy::CreatedAt => "created_at",
            AgeStrategy::IdOrder => "NULL",
        }
    }
}

enum AgeFilter {
    OlderThanMinutes(u32),
    SupersededInStatus,
}

fn read_batch_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BatchRow> {
    Ok(BatchRow {
        id: row.get(0)?,
        status: row.get(1)?,
        has_been_manipulated: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn insert_batch(conn: &Connection, status: BatchStatus) -> Result<BatchId, LedgerError> {
    conn.execute(
        "INSERT INTO batches (status, has_been_manipulated) VALUES (?1, 0)",
        params![status.as_str()],
    )?;
    Ok(conn.last_insert_rowid())
}

fn exists(conn: &Connection, id: BatchId) -> Result<bool, LedgerError> {
    let found = conn
        .query_row("SELECT 1 FROM batches WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

fn empty_batch_ids(
    conn: &Connection,
    statuses: &[BatchStatus],
    age: Option<AgeFilter>,
) -> Result<Vec<BatchId>, LedgerError> {
    let mut values: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
    let age_clause = match age {
        None => String::new(),
        Some(AgeFilter::OlderThanMinutes(minutes)) => {
            values.push(format!("-{minutes} minutes"));
            " AND b.created_at < datetime('now', ?)".to_string()
        }
        Some(AgeFilter::SupersededInStatus) => {
            " AND b.id < (SELECT MAX(n.id) FROM batches n WHERE n.status = b.status)".to_string()
        }
    };

    let sql = format!(
        "SELECT b.id FROM batches b WHERE b.status IN ({}) AND {EMPTY}{age_clause} ORDER BY b.id ASC",
        placeholders(statuses.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, BatchId>(0))?;

    let mut ids = Vec::new();
    for id in rows {
        ids.push(id?);
    }
    Ok(ids)
}
