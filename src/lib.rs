//! Smart-batch intake engine.
//!
//! Classifies scanned intake files as single documents or batch scans, routes
//! them through separate cohorts into ledger-managed batches, and streams
//! cancellable progress to subscribers.

pub mod config;
pub mod db;
pub mod models;
pub mod pipeline;

pub use pipeline::channel::{ChannelError, EventStream, ProgressChannel, RunToken};
pub use pipeline::detection::{ClassificationResult, DocumentTypeDetector};
pub use pipeline::ledger::BatchLedger;
pub use pipeline::orchestrator::{ProgressEvent, RunRequest, SmartOrchestrator};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over the default
/// filter. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter()));

    if tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok() {
        tracing::info!("{} v{} tracing initialized", config::APP_NAME, config::APP_VERSION);
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn init_tracing_is_idempotent() {
        super::init_tracing();
        super::init_tracing();
    }
}
