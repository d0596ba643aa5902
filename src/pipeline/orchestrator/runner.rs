use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::cache::ClassificationCache;
use super::cohort::{ClassifiedFile, CohortProcessor};
use super::events::{DocumentStatus, Phase, ProgressEvent};
use super::OrchestratorError;
use crate::config::EngineConfig;
use crate::models::{BatchId, BatchStatus, IntakeFile, Strategy};
use crate::pipeline::detection::{
    ClassificationResult, DocumentTypeDetector, OllamaOracle, PageTextSource,
};
use crate::pipeline::ledger::{BatchLedger, LedgerError};

/// Resolve attempts before falling back to a direct insert.
pub const MAX_LEDGER_RETRIES: u32 = 3;

const EVENT_BUFFER: usize = 64;

/// Per-filename strategy overrides supplied by the caller.
pub type Overrides = HashMap<String, Strategy>;

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub files: Vec<IntakeFile>,
    /// Batch for the batch-scan cohort. Single documents always get their own.
    pub batch_id: Option<BatchId>,
    pub overrides: Overrides,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Complete,
    Cancelled,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub progress: usize,
    pub total: usize,
    pub single_batch_id: Option<BatchId>,
    pub batch_scan_batch_id: Option<BatchId>,
    pub events_emitted: usize,
}

/// Claims a resolved batch for a cohort before any document lands in it.
///
/// `NotFound` means the batch vanished between resolution and claim; the
/// orchestrator resolves again.
pub trait BatchClaimer: Send + Sync {
    fn claim(&self, ledger: &BatchLedger, cohort: Strategy, id: BatchId) -> Result<(), LedgerError>;
}

/// Single documents claim by existence; batch scans move the batch to
/// `processing`.
pub struct LedgerClaimer;

impl BatchClaimer for LedgerClaimer {
    fn claim(&self, ledger: &BatchLedger, cohort: Strategy, id: BatchId) -> Result<(), LedgerError> {
        match cohort {
            Strategy::SingleDocument => {
                if ledger.batch_exists(id)? {
                    Ok(())
                } else {
                    Err(LedgerError::NotFound(id))
                }
            }
            Strategy::BatchScan => ledger.set_status(id, BatchStatus::Processing),
        }
    }
}

enum Flow {
    Continue,
    Cancelled,
}

/// Run-wide counters and the event sink.
struct Relay<'s> {
    sink: &'s mut dyn FnMut(ProgressEvent),
    progress: usize,
    total: usize,
    single_batch_id: Option<BatchId>,
    batch_scan_batch_id: Option<BatchId>,
    emitted: usize,
}

impl<'s> Relay<'s> {
    fn new(sink: &'s mut dyn FnMut(ProgressEvent), total: usize) -> Self {
        Self {
            sink,
            progress: 0,
            total,
            single_batch_id: None,
            batch_scan_batch_id: None,
            emitted: 0,
        }
    }

    fn event(&self, phase: Phase, message: impl Into<String>) -> ProgressEvent {
        ProgressEvent::new(phase, self.progress, self.total, message)
            .with_batches(self.single_batch_id, self.batch_scan_batch_id)
    }

    fn emit(&mut self, event: ProgressEvent) {
        self.emitted += 1;
        (self.sink)(event);
    }

    /// Emit the single terminal event and summarize.
    fn finish(mut self, outcome: RunOutcome) -> RunSummary {
        let event = match &outcome {
            RunOutcome::Complete => ProgressEvent {
                complete: true,
                ..self.event(Phase::Complete, format!("Processed {} file(s)", self.progress))
            },
            RunOutcome::Cancelled => ProgressEvent {
                cancelled: true,
                ..self.event(Phase::Cancelled, "Run cancelled")
            },
            RunOutcome::Error(message) => ProgressEvent {
                error: Some(message.clone()),
                ..self.event(Phase::Error, format!("Run failed: {message}"))
            },
        };
        self.emit(event);

        RunSummary {
            outcome,
            progress: self.progress,
            total: self.total,
            single_batch_id: self.single_batch_id,
            batch_scan_batch_id: self.batch_scan_batch_id,
            events_emitted: self.emitted,
        }
    }
}

/// Classifies intake files and drives both cohorts through their batches.
pub struct SmartOrchestrator {
    detector: DocumentTypeDetector,
    ledger: BatchLedger,
    processor: Arc<dyn CohortProcessor>,
    claimer: Arc<dyn BatchClaimer>,
    cache: ClassificationCache,
}

impl SmartOrchestrator {
    pub fn new(
        detector: DocumentTypeDetector,
        ledger: BatchLedger,
        processor: Arc<dyn CohortProcessor>,
    ) -> Self {
        Self {
            detector,
            ledger,
            processor,
            claimer: Arc::new(LedgerClaimer),
            cache: ClassificationCache::new(),
        }
    }

    /// Ledger, persistent cache, decision policy and (when enabled) the
    /// Ollama oracle, all from `config`.
    pub fn from_config(
        config: &EngineConfig,
        pages: Arc<dyn PageTextSource>,
        processor: Arc<dyn CohortProcessor>,
    ) -> Result<Self, LedgerError> {
        let mut detector = DocumentTypeDetector::from_config(config, pages);
        if config.oracle_enabled {
            detector = detector.with_oracle(
                Arc::new(OllamaOracle::from_config(config)),
                config.oracle_timeout(),
            );
        }
        let ledger = BatchLedger::from_config(config)?;

        let mut orchestrator = Self::new(detector, ledger, processor);
        if let Some(path) = &config.cache_file {
            orchestrator = orchestrator.with_cache(ClassificationCache::persistent(path));
        }
        Ok(orchestrator)
    }

    pub fn with_cache(mut self, cache: ClassificationCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_claimer(mut self, claimer: Arc<dyn BatchClaimer>) -> Self {
        self.claimer = claimer;
        self
    }

    pub fn ledger(&self) -> &BatchLedger {
        &self.ledger
    }

    pub fn cache(&self) -> &ClassificationCache {
        &self.cache
    }

    // ═══════════════════════════════════════════════════════════
    // Classification
    // ═══════════════════════════════════════════════════════════

    /// Classify every file, using the cache where it is fresh, then apply
    /// the raw-image rule and the caller's overrides.
    pub fn classify_all(&self, files: &[IntakeFile], overrides: &Overrides) -> Vec<ClassifiedFile> {
        let mut classified = Vec::with_capacity(files.len());
        let mut fresh = 0usize;

        for file in files {
            let mut result = match self.cache.get(file) {
                Some(result) => result,
                None => {
                    fresh += 1;
                    let result = self.detector.analyze(file);
                    self.cache.insert(file, result.clone());
                    result
                }
            };
            apply_overrides(file, &mut result, overrides);
            classified.push(ClassifiedFile {
                file: file.clone(),
                result,
            });
        }

        if fresh > 0 {
            if let Err(e) = self.cache.save() {
                tracing::warn!(error = %e, "Could not persist classification cache");
            }
        }
        tracing::debug!(files = files.len(), fresh, "Classification finished");
        classified
    }

    // ═══════════════════════════════════════════════════════════
    // Run
    // ═══════════════════════════════════════════════════════════

    /// Run to completion on the current thread, feeding events to `sink`.
    /// Exactly one terminal event is emitted.
    pub fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
        sink: &mut dyn FnMut(ProgressEvent),
    ) -> RunSummary {
        let mut relay = Relay::new(sink, request.files.len());
        tracing::info!(files = relay.total, external_batch = ?request.batch_id, "Run started");

        let analyzing = relay.event(Phase::Analyzing, format!("Analyzing {} file(s)", relay.total));
        relay.emit(analyzing);

        let outcome = match self.execute(&request, cancel, &mut relay) {
            Ok(Flow::Continue) => RunOutcome::Complete,
            Ok(Flow::Cancelled) => RunOutcome::Cancelled,
            Err(e) => {
                tracing::error!(error = %e, "Run failed");
                RunOutcome::Error(e.to_string())
            }
        };

        let summary = relay.finish(outcome);
        tracing::info!(
            outcome = ?summary.outcome,
            progress = summary.progress,
            total = summary.total,
            single_batch = ?summary.single_batch_id,
            batch_scan_batch = ?summary.batch_scan_batch_id,
            "Run finished"
        );
        summary
    }

    /// Run on the blocking pool and stream events through a channel.
    /// Dropping the receiver cancels the run.
    pub fn start(
        self: &Arc<Self>,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let orchestrator = Arc::clone(self);

        tokio::task::spawn_blocking(move || {
            let mut sink = |event: ProgressEvent| {
                if tx.blocking_send(event).is_err() && !cancel.is_cancelled() {
                    tracing::debug!("Event receiver dropped, cancelling run");
                    cancel.cancel();
                }
            };
            orchestrator.run(request, &cancel, &mut sink);
        });

        rx
    }

    fn execute(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
        relay: &mut Relay<'_>,
    ) -> Result<Flow, OrchestratorError> {
        let classified = self.classify_all(&request.files, &request.overrides);
        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        let (singles, batch_scans): (Vec<_>, Vec<_>) = classified
            .into_iter()
            .partition(|c| c.strategy() == Strategy::SingleDocument);
        relay.total = singles.len() + batch_scans.len();
        tracing::info!(singles = singles.len(), batch_scans = batch_scans.len(), "Intake split");

        if !singles.is_empty() {
            let batch_id = self.resolve_batch(Strategy::SingleDocument, request.batch_id)?;
            relay.single_batch_id = Some(batch_id);

            if let Flow::Cancelled =
                self.run_cohort(Strategy::SingleDocument, singles, batch_id, cancel, relay)?
            {
                return Ok(Flow::Cancelled);
            }
            if let Err(e) = self.ledger.set_status(batch_id, BatchStatus::Ready) {
                tracing::warn!(batch_id, error = %e, "Could not mark single-document batch ready");
            }
        }

        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }

        if !batch_scans.is_empty() {
            let batch_id = self.resolve_batch(Strategy::BatchScan, request.batch_id)?;
            relay.batch_scan_batch_id = Some(batch_id);

            if let Flow::Cancelled =
                self.run_cohort(Strategy::BatchScan, batch_scans, batch_id, cancel, relay)?
            {
                return Ok(Flow::Cancelled);
            }
        }

        Ok(Flow::Continue)
    }

    fn run_cohort(
        &self,
        cohort: Strategy,
        files: Vec<ClassifiedFile>,
        batch_id: BatchId,
        cancel: &CancellationToken,
        relay: &mut Relay<'_>,
    ) -> Result<Flow, OrchestratorError> {
        let (phase, label) = match cohort {
            Strategy::SingleDocument => (Phase::SingleDocuments, "single document(s)"),
            Strategy::BatchScan => (Phase::BatchScans, "batch scan(s)"),
        };
        let base = relay.progress;
        let size = files.len();

        let started = relay.event(phase, format!("Processing {size} {label} into batch {batch_id}"));
        relay.emit(started);

        let mut events = self.processor.process(cohort, files, batch_id, cancel.clone())?;
        loop {
            // Checked before every pull: pulling starts the next document
            if cancel.is_cancelled() {
                tracing::info!(%cohort, batch_id, progress = relay.progress, "Run cancelled mid-cohort");
                return Ok(Flow::Cancelled);
            }
            let Some(item) = events.next() else {
                break;
            };
            let event = item?;

            // Phase-local count mapped onto the run counter, never moving back
            relay.progress = (base + event.documents_completed.min(size)).max(relay.progress);

            if event.status == DocumentStatus::Failed {
                tracing::warn!(file = %event.filename, batch_id, "Document failed, continuing");
            }
            let message = event
                .message
                .clone()
                .unwrap_or_else(|| format!("{}: {}", event.filename, status_label(event.status)));
            let progress = relay
                .event(phase, message)
                .with_file(event.filename, event.status);
            relay.emit(progress);
        }

        if cancel.is_cancelled() {
            return Ok(Flow::Cancelled);
        }
        relay.progress = base + size;
        Ok(Flow::Continue)
    }

    // ═══════════════════════════════════════════════════════════
    // Batch resolution
    // ═══════════════════════════════════════════════════════════

    /// Resolve and claim the batch for a cohort, retrying when the resolved
    /// batch disappears before it can be claimed.
    ///
    /// `external` is the caller's batch: used for batch scans, and never
    /// shared with single documents.
    fn resolve_batch(
        &self,
        cohort: Strategy,
        external: Option<BatchId>,
    ) -> Result<BatchId, OrchestratorError> {
        let no_batch = |source| OrchestratorError::NoBatch { cohort, source };

        for attempt in 1..=MAX_LEDGER_RETRIES {
            let resolved = match (cohort, external) {
                (Strategy::SingleDocument, _) => {
                    self.ledger.get_or_create_intake_batch().and_then(|id| {
                        if Some(id) == external {
                            self.ledger.create_new_batch(BatchStatus::Intake)
                        } else {
                            Ok(id)
                        }
                    })
                }
                (Strategy::BatchScan, Some(id)) if attempt == 1 => Ok(id),
                (Strategy::BatchScan, _) => self.ledger.get_or_create_processing_batch(),
            }
            .map_err(no_batch)?;

            match self.claimer.claim(&self.ledger, cohort, resolved) {
                Ok(()) => return Ok(resolved),
                Err(LedgerError::NotFound(id)) => {
                    tracing::warn!(batch_id = id, attempt, %cohort, "Resolved batch vanished, retrying");
                }
                Err(e) => return Err(no_batch(e)),
            }
        }

        let status = match cohort {
            Strategy::SingleDocument => BatchStatus::Intake,
            Strategy::BatchScan => BatchStatus::Processing,
        };
        tracing::warn!(%cohort, retries = MAX_LEDGER_RETRIES, "Batch resolution kept racing, inserting a batch directly");
        // Inserted with its final status, so no claim is needed
        self.ledger.create_new_batch(status).map_err(no_batch)
    }
}

fn apply_overrides(file: &IntakeFile, result: &mut ClassificationResult, overrides: &Overrides) {
    if file.is_raw_image && result.strategy != Strategy::SingleDocument {
        result.override_strategy(
            Strategy::SingleDocument,
            "Raw image: always processed as a single document",
        );
    }
    if let Some(&strategy) = overrides.get(&file.filename()) {
        result.override_strategy(strategy, format!("User override: {strategy}"));
    }
}

fn status_label(status: DocumentStatus) -> &'static str {
    match status {
        DocumentStatus::Processing => "processing",
        DocumentStatus::Completed => "done",
        DocumentStatus::Failed => "failed",
        DocumentStatus::Skipped => "skipped",
    }
}
