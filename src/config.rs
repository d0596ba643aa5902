use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Application-level constants
pub const APP_NAME: &str = "SmartBatch";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default oracle endpoint (local Ollama instance).
pub const DEFAULT_ORACLE_URL: &str = "http://localhost:11434";
pub const DEFAULT_ORACLE_MODEL: &str = "llama3.2:3b";

/// Tokens not consumed within this window are evicted.
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 60 * 60;

/// Silence on an event stream longer than this produces a heartbeat.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;

/// Default oracle call budget.
pub const DEFAULT_ORACLE_TIMEOUT_SECS: u64 = 30;

/// Get the application data directory
/// ~/SmartBatch/ on all platforms. Falls back to the working directory when
/// no home directory can be resolved (containers, service accounts).
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Default location of the batch ledger database.
pub fn ledger_db_path() -> PathBuf {
    app_data_dir().join("ledger.db")
}

/// Default location of the persisted classification cache.
pub fn classification_cache_path() -> PathBuf {
    app_data_dir().join("classification_cache.json")
}

/// Default root for retention backups (`<root>/batch_<id>/...`).
pub fn retention_backup_dir() -> PathBuf {
    app_data_dir().join("retention")
}

/// Default tracing filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,smartbatch=debug,reqwest=warn,hyper=warn"
}

/// Runtime configuration for the engine.
///
/// Every field has a default; `from_env` overlays `SMARTBATCH_*` variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub ledger_db: PathBuf,
    pub cache_file: Option<PathBuf>,
    pub oracle_enabled: bool,
    pub oracle_url: String,
    pub oracle_model: String,
    pub oracle_timeout_secs: u64,
    pub retention_guard: bool,
    pub retention_backup_dir: PathBuf,
    /// Score margin single must clear over batch.
    pub decision_margin: u32,
    /// Minimum max/(single+batch) ratio for a single-document verdict.
    pub decision_min_confidence: f32,
    pub token_ttl_secs: u64,
    pub heartbeat_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: app_data_dir(),
            ledger_db: ledger_db_path(),
            cache_file: Some(classification_cache_path()),
            oracle_enabled: false,
            oracle_url: DEFAULT_ORACLE_URL.to_string(),
            oracle_model: DEFAULT_ORACLE_MODEL.to_string(),
            oracle_timeout_secs: DEFAULT_ORACLE_TIMEOUT_SECS,
            retention_guard: true,
            retention_backup_dir: retention_backup_dir(),
            decision_margin: 2,
            decision_min_confidence: 0.7,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `SMARTBATCH_*` environment variables.
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup("SMARTBATCH_DATA_DIR") {
            let dir = PathBuf::from(dir);
            config.ledger_db = dir.join("ledger.db");
            config.cache_file = Some(dir.join("classification_cache.json"));
            config.retention_backup_dir = dir.join("retention");
            config.data_dir = dir;
        }
        if let Some(path) = lookup("SMARTBATCH_LEDGER_DB") {
            config.ledger_db = PathBuf::from(path);
        }
        if let Some(url) = lookup("SMARTBATCH_ORACLE_URL") {
            config.oracle_url = url;
            config.oracle_enabled = true;
        }
        if let Some(model) = lookup("SMARTBATCH_ORACLE_MODEL") {
            config.oracle_model = model;
        }
        if let Some(dir) = lookup("SMARTBATCH_RETENTION_DIR") {
            config.retention_backup_dir = PathBuf::from(dir);
        }

        parse_into(&lookup, "SMARTBATCH_ORACLE_ENABLED", &mut config.oracle_enabled);
        parse_into(&lookup, "SMARTBATCH_ORACLE_TIMEOUT_SECS", &mut config.oracle_timeout_secs);
        parse_into(&lookup, "SMARTBATCH_RETENTION_GUARD", &mut config.retention_guard);
        parse_into(&lookup, "SMARTBATCH_DECISION_MARGIN", &mut config.decision_margin);
        parse_into(&lookup, "SMARTBATCH_DECISION_MIN_CONFIDENCE", &mut config.decision_min_confidence);
        parse_into(&lookup, "SMARTBATCH_TOKEN_TTL_SECS", &mut config.token_ttl_secs);
        parse_into(&lookup, "SMARTBATCH_HEARTBEAT_SECS", &mut config.heartbeat_secs);

        config
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring unparseable config value"),
        }
    }
}
