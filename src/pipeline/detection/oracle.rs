//! Optional text-classification oracle.
//!
//! The oracle sees a content sample plus basic metadata and answers with a
//! strategy and a 0-100 confidence. The detector bounds every call with a
//! timeout; an oracle that is slow, down or incoherent never blocks routing.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Strategy;

/// Longest content sample forwarded to the oracle.
const MAX_SAMPLE_CHARS: usize = 4_000;

const SYSTEM_PROMPT: &str = "You classify scanned files. Decide whether the text comes from ONE \
document or from SEVERAL unrelated documents scanned together. Reply with JSON only: \
{\"classification\": \"single_document\" | \"batch_scan\", \"confidence\": 0-100, \"reasoning\": \"...\"}";

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Cannot reach oracle at {0}")]
    Connection(String),

    #[error("Oracle returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Oracle did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Oracle reply could not be parsed: {0}")]
    InvalidResponse(String),

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    pub content_sample: String,
    pub filename: String,
    pub page_count: u32,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleVerdict {
    pub classification: Strategy,
    /// 0-100
    pub confidence: f32,
    pub reasoning: String,
}

/// Classifies a content sample. Implementations may block.
pub trait ClassificationOracle: Send + Sync {
    fn classify(&self, request: &OracleRequest) -> Result<OracleVerdict, OracleError>;
}

/// Run `oracle` on a worker thread and give up after `timeout`.
///
/// A timed-out call keeps running on its thread until the oracle returns;
/// its answer is discarded.
pub fn consult_with_timeout(
    oracle: Arc<dyn ClassificationOracle>,
    request: OracleRequest,
    timeout: Duration,
) -> Result<OracleVerdict, OracleError> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("oracle-call".into())
        .spawn(move || {
            let _ = tx.send(oracle.classify(&request));
        })
        .map_err(|e| OracleError::Unavailable(format!("cannot spawn oracle thread: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(OracleError::Timeout(timeout)),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(OracleError::Unavailable("oracle thread exited without answering".into()))
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Reply parsing
// ═══════════════════════════════════════════════════════════

#[derive(Deserialize)]
struct RawVerdict {
    classification: String,
    confidence: serde_json::Value,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Parse an oracle reply into a verdict.
///
/// Accepts bare JSON, JSON wrapped in prose, or a fenced code block. A
/// confidence in (0, 1] is read as a fraction and scaled to 0-100.
pub fn parse_oracle_reply(reply: &str) -> Result<OracleVerdict, OracleError> {
    let start = reply
        .find('{')
        .ok_or_else(|| OracleError::InvalidResponse("no JSON object in reply".into()))?;
    let end = reply
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| OracleError::InvalidResponse("unterminated JSON object".into()))?;

    let raw: RawVerdict = serde_json::from_str(&reply[start..=end])
        .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

    let classification = Strategy::from_label(&raw.classification).ok_or_else(|| {
        OracleError::InvalidResponse(format!("unknown classification '{}'", raw.classification))
    })?;

    let confidence = match &raw.confidence {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| OracleError::InvalidResponse(format!("bad confidence {}", raw.confidence)))?;

    let confidence = if confidence > 0.0 && confidence <= 1.0 {
        confidence * 100.0
    } else {
        confidence
    };

    Ok(OracleVerdict {
        classification,
        confidence: confidence.clamp(0.0, 100.0) as f32,
        reasoning: raw.reasoning.unwrap_or_default(),
    })
}

fn build_prompt(request: &OracleRequest) -> String {
    let sample: String = request.content_sample.chars().take(MAX_SAMPLE_CHARS).collect();
    format!(
        "Filename: {}\nPages: {}\nSize: {} bytes\n\nSampled text (first, middle and last pages):\n{}\n",
        request.filename, request.page_count, request.file_size, sample
    )
}

// ═══════════════════════════════════════════════════════════
// Ollama
// ═══════════════════════════════════════════════════════════

/// Oracle backed by an Ollama-compatible `/api/generate` endpoint.
pub struct OllamaOracle {
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    format: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaOracle {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &crate::config::EngineConfig) -> Self {
        Self::new(&config.oracle_url, &config.oracle_model, config.oracle_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // Built per call: the blocking client owns a runtime and must not be
    // created or dropped on an async executor thread.
    fn client(&self) -> Result<reqwest::blocking::Client, OracleError> {
        reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| OracleError::Unavailable(e.to_string()))
    }
}

impl ClassificationOracle for OllamaOracle {
    fn classify(&self, request: &OracleRequest) -> Result<OracleVerdict, OracleError> {
        let url = format!("{}/api/generate", self.base_url);
        let prompt = build_prompt(request);
        let body = GenerateRequest {
            model: &self.model,
            prompt: &prompt,
            system: SYSTEM_PROMPT,
            stream: false,
            format: "json",
        };

        let response = self.client()?.post(&url).json(&body).send().map_err(|e| {
            if e.is_connect() {
                OracleError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                OracleError::Timeout(self.timeout)
            } else {
                OracleError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(OracleError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

        tracing::debug!(model = %self.model, chars = parsed.response.len(), "Oracle replied");
        parse_oracle_reply(&parsed.response)
    }
}

/// Oracle returning a fixed answer, optionally after a delay.
pub struct MockOracle {
    reply: Result<OracleVerdict, String>,
    delay: Duration,
}

impl MockOracle {
    pub fn verdict(classification: Strategy, confidence: f32) -> Self {
        Self {
            reply: Ok(OracleVerdict {
                classification,
                confidence,
                reasoning: "mock verdict".into(),
            }),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            reply: Err(reason.to_string()),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl ClassificationOracle for MockOracle {
    fn classify(&self, _request: &OracleRequest) -> Result<OracleVerdict, OracleError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.reply
            .clone()
            .map_err(OracleError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn request() -> OracleRequest {
        OracleRequest {
            content_sample: "text".into(),
            filename: "a.pdf".into(),
            page_count: 3,
            file_size: 1024,
        }
    }

    #[test]
    fn parses_bare_json() {
        let verdict = parse_oracle_reply(
            r#"{"classification": "batch_scan", "confidence": 85, "reasoning": "three letterheads"}"#,
        )
        .unwrap();
        assert_eq!(verdict.classification, Strategy::BatchScan);
        assert_eq!(verdict.confidence, 85.0);
        assert_eq!(verdict.reasoning, "three letterheads");
    }

    #[test]
    fn parses_fenced_json_with_prose() {
        let reply = "Sure, here is my answer:\n```json\n{\"classification\": \"single_document\", \"confidence\": \"72%\"}\n```";
        let verdict = parse_oracle_reply(reply).unwrap();
        assert_eq!(verdict.classification, Strategy::SingleDocument);
        assert_eq!(verdict.confidence, 72.0);
        assert!(verdict.reasoning.is_empty());
    }

    #[test]
    fn fractional_confidence_is_scaled() {
        let verdict =
            parse_oracle_reply(r#"{"classification": "single", "confidence": 0.9}"#).unwrap();
        assert_eq!(verdict.classification, Strategy::SingleDocument);
        assert!((verdict.confidence - 90.0).abs() < 1e-3);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_oracle_reply("I think it's one document"),
            Err(OracleError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_oracle_reply(r#"{"classification": "maybe", "confidence": 50}"#),
            Err(OracleError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_oracle_reply(r#"{"classification": "batch_scan", "confidence": null}"#),
            Err(OracleError::InvalidResponse(_))
        ));
    }

    #[test]
    fn prompt_truncates_long_samples() {
        let mut req = request();
        req.content_sample = "x".repeat(MAX_SAMPLE_CHARS * 2);
        let prompt = build_prompt(&req);
        assert!(prompt.len() < MAX_SAMPLE_CHARS + 200);
    }

    #[test]
    fn timeout_is_enforced_by_caller() {
        let slow = MockOracle::verdict(Strategy::BatchScan, 99.0).with_delay(Duration::from_secs(2));
        let started = Instant::now();
        let result = consult_with_timeout(Arc::new(slow), request(), Duration::from_millis(50));
        assert!(matches!(result, Err(OracleError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn fast_oracle_answers_within_budget() {
        let oracle = MockOracle::verdict(Strategy::SingleDocument, 80.0);
        let verdict =
            consult_with_timeout(Arc::new(oracle), request(), Duration::from_secs(1)).unwrap();
        assert_eq!(verdict.classification, Strategy::SingleDocument);
    }

    #[test]
    fn unreachable_ollama_is_an_error_not_a_panic() {
        // Port 9 (discard) is closed on test hosts
        let oracle = OllamaOracle::new("http://127.0.0.1:9/", "any", Duration::from_secs(2));
        assert_eq!(oracle.base_url(), "http://127.0.0.1:9");
        assert!(oracle.classify(&request()).is_err());
    }
}
