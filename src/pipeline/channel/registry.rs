use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::stream::EventStream;
use super::sweeper::SweeperHandle;
use super::ChannelError;
use crate::config::{EngineConfig, DEFAULT_HEARTBEAT_SECS, DEFAULT_TOKEN_TTL_SECS};
use crate::models::{BatchId, IntakeFile};
use crate::pipeline::orchestrator::{Overrides, ProgressEvent, RunRequest, SmartOrchestrator};

const EVENT_BUFFER: usize = 64;

/// Opaque run handle. No structure is promised to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunToken(String);

impl RunToken {
    fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

struct Registration {
    created_at: Instant,
    request: Option<RunRequest>,
    cancel: CancellationToken,
}

impl Registration {
    fn started(&self) -> bool {
        self.request.is_none()
    }

    /// Only unstarted registrations expire.
    fn expired(&self, ttl: Duration) -> bool {
        !self.started() && self.created_at.elapsed() > ttl
    }
}

struct Inner {
    orchestrator: Arc<SmartOrchestrator>,
    registry: Mutex<HashMap<RunToken, Registration>>,
    ttl: Duration,
    heartbeat: Duration,
    shutdown: CancellationToken,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, HashMap<RunToken, Registration>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict(&self, token: &RunToken) {
        if self.registry().remove(token).is_some() {
            tracing::debug!(%token, "Token evicted");
        }
    }

    /// Drop unstarted registrations older than the TTL.
    fn evict_expired(&self, registry: &mut HashMap<RunToken, Registration>) -> usize {
        let before = registry.len();
        registry.retain(|_, reg| !reg.expired(self.ttl));
        before - registry.len()
    }

    /// Look up a live registration. An expired one is removed and reported
    /// as invalid, whether or not a sweep has run yet.
    fn live<'r>(
        &self,
        registry: &'r mut HashMap<RunToken, Registration>,
        token: &RunToken,
    ) -> Result<&'r mut Registration, ChannelError> {
        let expired = registry
            .get(token)
            .ok_or_else(|| ChannelError::InvalidToken(token.to_string()))?
            .expired(self.ttl);
        if expired {
            registry.remove(token);
            tracing::debug!(%token, "Expired token rejected");
            return Err(ChannelError::InvalidToken(token.to_string()));
        }
        registry
            .get_mut(token)
            .ok_or_else(|| ChannelError::InvalidToken(token.to_string()))
    }

    /// Claim a registered run for starting.
    fn claim(&self, token: &RunToken) -> Result<(RunRequest, CancellationToken), ChannelError> {
        let mut registry = self.registry();
        let reg = self.live(&mut registry, token)?;
        let request = reg
            .request
            .take()
            .ok_or_else(|| ChannelError::AlreadyStarted(token.to_string()))?;
        Ok((request, reg.cancel.clone()))
    }
}

/// Process-scoped registry of orchestration runs.
///
/// Cloning shares the registry. Methods that start runs must be called from
/// within a tokio runtime.
#[derive(Clone)]
pub struct ProgressChannel {
    inner: Arc<Inner>,
}

impl ProgressChannel {
    pub fn new(orchestrator: Arc<SmartOrchestrator>) -> Self {
        Self::with_timing(
            orchestrator,
            Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
            Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
        )
    }

    pub fn from_config(orchestrator: Arc<SmartOrchestrator>, config: &EngineConfig) -> Self {
        Self::with_timing(orchestrator, config.token_ttl(), config.heartbeat_interval())
    }

    pub fn with_timing(orchestrator: Arc<SmartOrchestrator>, ttl: Duration, heartbeat: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                registry: Mutex::new(HashMap::new()),
                ttl,
                heartbeat,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a run. Expired, unstarted tokens are evicted on the way.
    pub fn issue(
        &self,
        files: Vec<IntakeFile>,
        batch_id: Option<BatchId>,
        overrides: Overrides,
    ) -> RunToken {
        let token = RunToken::generate();
        let mut registry = self.inner.registry();

        let evicted = self.inner.evict_expired(&mut registry);
        if evicted > 0 {
            tracing::debug!(evicted, "Expired tokens evicted");
        }

        tracing::info!(%token, files = files.len(), ?batch_id, "Run token issued");
        registry.insert(
            token.clone(),
            Registration {
                created_at: Instant::now(),
                request: Some(RunRequest {
                    files,
                    batch_id,
                    overrides,
                }),
                cancel: self.inner.shutdown.child_token(),
            },
        );
        token
    }

    /// Start the run and stream its events. A heartbeat is injected whenever
    /// the run stays silent for the heartbeat interval.
    pub fn subscribe(&self, token: &RunToken) -> Result<EventStream, ChannelError> {
        let (request, cancel) = self.inner.claim(token)?;
        let run_rx = self.inner.orchestrator.start(request, cancel.clone());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(relay(
            Arc::clone(&self.inner),
            token.clone(),
            run_rx,
            tx,
            cancel,
        ));
        Ok(EventStream::new(token.clone(), rx))
    }

    /// Start the run with nobody listening; events go to the log.
    pub fn start_detached(&self, token: &RunToken) -> Result<(), ChannelError> {
        let (request, cancel) = self.inner.claim(token)?;
        let mut run_rx = self.inner.orchestrator.start(request, cancel);
        let inner = Arc::clone(&self.inner);
        let token = token.clone();

        tokio::spawn(async move {
            while let Some(event) = run_rx.recv().await {
                if event.is_terminal() {
                    tracing::info!(%token, progress = event.progress, total = event.total,
                        complete = event.complete, cancelled = event.cancelled, error = ?event.error,
                        "Detached run finished");
                    break;
                }
                tracing::debug!(%token, progress = event.progress, total = event.total, message = %event.message, "Detached run progress");
            }
            inner.evict(&token);
        });
        Ok(())
    }

    /// Request cooperative cancellation of a run.
    pub fn cancel(&self, token: &RunToken) -> Result<(), ChannelError> {
        let mut registry = self.inner.registry();
        let reg = self.inner.live(&mut registry, token)?;
        reg.cancel.cancel();
        tracing::info!(%token, started = reg.started(), "Run cancellation requested");
        Ok(())
    }

    pub fn is_registered(&self, token: &RunToken) -> bool {
        self.inner.registry().contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.inner.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict expired, unstarted tokens now.
    pub fn sweep(&self) -> usize {
        let mut registry = self.inner.registry();
        self.inner.evict_expired(&mut registry)
    }

    /// Sweep expired tokens every `every` until shutdown.
    pub fn spawn_sweeper(&self, every: Duration) -> SweeperHandle {
        let stop = self.inner.shutdown.child_token();
        let channel = self.clone();
        let stopped = stop.clone();

        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = every.as_secs_f64(), "Token sweeper started");
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        let evicted = channel.sweep();
                        if evicted > 0 {
                            tracing::debug!(evicted, "Token sweep");
                        }
                    }
                }
            }
            tracing::info!("Token sweeper stopped");
        });

        SweeperHandle::new(stop, handle)
    }

    /// Stop the sweeper and cancel every registered run.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let runs = self.inner.registry().len();
        tracing::info!(runs, "Progress channel shut down");
    }
}

async fn relay(
    inner: Arc<Inner>,
    token: RunToken,
    mut run_rx: mpsc::Receiver<ProgressEvent>,
    tx: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
) {
    let heartbeat = inner.heartbeat;
    let (mut progress, mut total) = (0, 0);

    loop {
        tokio::select! {
            next = run_rx.recv() => {
                let Some(event) = next else { break };
                progress = event.progress;
                total = event.total;
                let terminal = event.is_terminal();

                if tx.send(event).await.is_err() {
                    tracing::debug!(%token, "Subscriber went away, cancelling run");
                    cancel.cancel();
                    break;
                }
                if terminal {
                    break;
                }
            }
            _ = tokio::time::sleep(heartbeat) => {
                if tx.send(ProgressEvent::heartbeat(progress, total)).await.is_err() {
                    cancel.cancel();
                    break;
                }
            }
        }
    }

    inner.evict(&token);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Strategy;
    use crate::pipeline::detection::DocumentTypeDetector;
    use crate::pipeline::ledger::{BatchLedger, RetentionGuard};
    use crate::pipeline::orchestrator::{
        ClassifiedFile, CohortError, CohortEvent, CohortEvents, CohortProcessor, DocumentStatus,
        LedgerRecorder,
    };
    use futures_util::StreamExt;

    const MB: u64 = 1024 * 1024;

    /// Sleeps before each document.
    struct SlowProcessor {
        delay: Duration,
    }

    impl CohortProcessor for SlowProcessor {
        fn process<'a>(
            &'a self,
            _cohort: Strategy,
            files: Vec<ClassifiedFile>,
            batch_id: BatchId,
            cancel: CancellationToken,
        ) -> Result<CohortEvents<'a>, CohortError> {
            let delay = self.delay;
            Ok(Box::new(
                files
                    .into_iter()
                    .take_while(move |_| !cancel.is_cancelled())
                    .enumerate()
                    .map(move |(index, classified)| -> Result<CohortEvent, CohortError> {
                        std::thread::sleep(delay);
                        Ok(CohortEvent {
                            filename: classified.filename(),
                            status: DocumentStatus::Completed,
                            documents_completed: index + 1,
                            batch_id,
                            message: None,
                        })
                    }),
            ))
        }
    }

    fn files() -> Vec<IntakeFile> {
        vec![
            IntakeFile::new("/intake/memo.pdf", MB, 2, false),
            IntakeFile::new("/intake/scan_001.pdf", 80 * MB, 40, false),
        ]
    }

    fn orchestrator_with(
        dir: &tempfile::TempDir,
        processor: impl FnOnce(BatchLedger) -> Arc<dyn CohortProcessor>,
    ) -> Arc<SmartOrchestrator> {
        let ledger = BatchLedger::open(dir.path().join("ledger.db"), RetentionGuard::disabled()).unwrap();
        let processor = processor(ledger.clone());
        Arc::new(SmartOrchestrator::new(DocumentTypeDetector::default(), ledger, processor))
    }

    fn channel(dir: &tempfile::TempDir) -> ProgressChannel {
        ProgressChannel::new(orchestrator_with(dir, |ledger| Arc::new(LedgerRecorder::new(ledger))))
    }

    #[tokio::test]
    async fn subscribe_streams_run_and_evicts_token() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(&dir);
        let token = channel.issue(files(), None, Overrides::new());

        let events = channel.subscribe(&token).unwrap().collect().await;

        let last = events.last().unwrap();
        assert!(last.complete);
        assert_eq!((last.progress, last.total), (2, 2));
        assert_ne!(last.single_batch_id, last.batch_scan_batch_id);

        // Eviction happens right after the terminal event is relayed
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!channel.is_registered(&token));
        assert_eq!(
            channel.subscribe(&token).err(),
            Some(ChannelError::InvalidToken(token.to_string()))
        );
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(&dir);
        let bogus = RunToken::from("not-a-token");
        assert!(matches!(channel.subscribe(&bogus), Err(ChannelError::InvalidToken(_))));
        assert!(matches!(channel.cancel(&bogus), Err(ChannelError::InvalidToken(_))));
        assert!(matches!(channel.start_detached(&bogus), Err(ChannelError::InvalidToken(_))));
    }

    #[tokio::test]
    async fn expired_token_is_rejected_and_swept_on_issue() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(&dir, |ledger| Arc::new(LedgerRecorder::new(ledger)));
        let channel = ProgressChannel::with_timing(orchestrator, Duration::from_millis(20), Duration::from_secs(15));

        let stale = channel.issue(files(), None, Overrides::new());
        let also_stale = channel.issue(files(), None, Overrides::new());
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(matches!(channel.subscribe(&stale), Err(ChannelError::InvalidToken(_))));
        let _fresh = channel.issue(files(), None, Overrides::new());
        assert!(!channel.is_registered(&also_stale));
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn cancel_rejects_expired_token_before_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(&dir, |ledger| Arc::new(LedgerRecorder::new(ledger)));
        let channel = ProgressChannel::with_timing(orchestrator, Duration::from_millis(20), Duration::from_secs(15));

        let stale = channel.issue(files(), None, Overrides::new());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(channel.is_registered(&stale), "No sweep has run yet");

        assert_eq!(
            channel.cancel(&stale),
            Err(ChannelError::InvalidToken(stale.to_string()))
        );
        assert!(!channel.is_registered(&stale));
    }

    #[tokio::test]
    async fn second_subscribe_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ProgressChannel::new(orchestrator_with(&dir, |_| {
            Arc::new(SlowProcessor {
                delay: Duration::from_millis(100),
            })
        }));
        let token = channel.issue(files(), None, Overrides::new());

        let stream = channel.subscribe(&token).unwrap();
        assert!(matches!(channel.subscribe(&token), Err(ChannelError::AlreadyStarted(_))));
        stream.collect().await;
    }

    #[tokio::test]
    async fn cancel_ends_stream_with_cancelled_event() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ProgressChannel::new(orchestrator_with(&dir, |_| {
            Arc::new(SlowProcessor {
                delay: Duration::from_millis(100),
            })
        }));
        let token = channel.issue(files(), None, Overrides::new());

        let mut stream = channel.subscribe(&token).unwrap();
        let first = stream.next().await.unwrap();
        assert!(!first.is_terminal());
        channel.cancel(&token).unwrap();

        let rest = stream.collect().await;
        let last = rest.last().unwrap();
        assert!(last.cancelled);
        assert!(last.progress < last.total);
    }

    #[tokio::test]
    async fn silence_produces_heartbeats() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(&dir, |_| {
            Arc::new(SlowProcessor {
                delay: Duration::from_millis(300),
            })
        });
        let channel = ProgressChannel::with_timing(orchestrator, Duration::from_secs(60), Duration::from_millis(50));
        let token = channel.issue(files(), None, Overrides::new());

        let events = channel.subscribe(&token).unwrap().collect().await;

        assert!(events.iter().any(|e| e.heartbeat));
        assert!(events.last().unwrap().complete);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn into_stream_adapts_to_futures() {
        let dir = tempfile::tempdir().unwrap();
        let channel = channel(&dir);
        let token = channel.issue(files(), None, Overrides::new());

        let events: Vec<ProgressEvent> = channel.subscribe(&token).unwrap().into_stream().collect().await;
        assert!(events.last().unwrap().complete);
    }

    #[tokio::test]
    async fn detached_run_completes_and_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator_with(&dir, |ledger| Arc::new(LedgerRecorder::new(ledger)));
        let channel = ProgressChannel::new(Arc::clone(&orchestrator));
        let token = channel.issue(files(), None, Overrides::new());

        channel.start_detached(&token).unwrap();
        assert!(matches!(channel.start_detached(&token), Err(ChannelError::AlreadyStarted(_))));

        for _ in 0..100 {
            if !channel.is_registered(&token) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!channel.is_registered(&token));
        assert_eq!(orchestrator.ledger().list_batches().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sweeper_evicts_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ProgressChannel::with_timing(
            orchestrator_with(&dir, |ledger| Arc::new(LedgerRecorder::new(ledger))),
            Duration::from_millis(10),
            Duration::from_secs(15),
        );
        let sweeper = channel.spawn_sweeper(Duration::from_millis(20));
        let token = channel.issue(files(), None, Overrides::new());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!channel.is_registered(&token));

        channel.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test]
    async fn shutdown_cancels_registered_runs() {
        let dir = tempfile::tempdir().unwrap();
        let channel = ProgressChannel::new(orchestrator_with(&dir, |_| {
            Arc::new(SlowProcessor {
                delay: Duration::from_millis(100),
            })
        }));
        let token = channel.issue(files(), None, Overrides::new());
        let stream = channel.subscribe(&token).unwrap();

        channel.shutdown();

        let last = stream.collect().await.pop().unwrap();
        assert!(last.cancelled);
    }

    #[test]
    fn tokens_are_unique_uuids() {
        let a = RunToken::generate();
        let b = RunToken::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }
}
