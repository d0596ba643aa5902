use std::sync::Arc;
use std::time::Duration;

use crate::config::{EngineConfig, DEFAULT_ORACLE_TIMEOUT_SECS};
use crate::models::{IntakeFile, Strategy};
use crate::pipeline::extraction::RotationClassifier;

use super::heuristics::{score_content, score_metadata, DecisionPolicy, MIN_CONTENT_CHARS};
use super::oracle::{consult_with_timeout, ClassificationOracle, OracleRequest};
use super::sampling::{sample_content, NoPageText, PageTextSource};
use super::types::{ClassificationResult, OracleOutcome};
use super::DetectionError;

/// Oracle verdicts at or above this confidence (0-100) replace the heuristic.
pub const ORACLE_OVERRIDE_THRESHOLD: f32 = 70.0;

/// Decides `single_document` vs `batch_scan` for one intake file.
pub struct DocumentTypeDetector {
    policy: DecisionPolicy,
    pages: Arc<dyn PageTextSource>,
    oracle: Option<Arc<dyn ClassificationOracle>>,
    oracle_timeout: Duration,
    rotation: Option<RotationClassifier>,
}

impl Default for DocumentTypeDetector {
    fn default() -> Self {
        Self::new(Arc::new(NoPageText))
    }
}

impl DocumentTypeDetector {
    pub fn new(pages: Arc<dyn PageTextSource>) -> Self {
        Self {
            policy: DecisionPolicy::default(),
            pages,
            oracle: None,
            oracle_timeout: Duration::from_secs(DEFAULT_ORACLE_TIMEOUT_SECS),
            rotation: None,
        }
    }

    /// Policy and oracle timeout from an engine config. The oracle itself is
    /// attached separately with [`with_oracle`](Self::with_oracle).
    pub fn from_config(config: &EngineConfig, pages: Arc<dyn PageTextSource>) -> Self {
        let mut detector = Self::new(pages).with_policy(DecisionPolicy::new(
            config.decision_margin,
            config.decision_min_confidence,
        ));
        detector.oracle_timeout = config.oracle_timeout();
        detector
    }

    pub fn with_policy(mut self, policy: DecisionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn ClassificationOracle>, timeout: Duration) -> Self {
        self.oracle = Some(oracle);
        self.oracle_timeout = timeout;
        self
    }

    pub fn with_rotation(mut self, classifier: RotationClassifier) -> Self {
        self.rotation = Some(classifier);
        self
    }

    pub fn policy(&self) -> DecisionPolicy {
        self.policy
    }

    /// Classify one file. Never fails: anything that prevents analysis
    /// yields a zero-confidence batch scan.
    pub fn analyze(&self, file: &IntakeFile) -> ClassificationResult {
        let mut result = match self.try_analyze(file) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(file = %file.filename(), error = %e, "Classification failed, defaulting to batch scan");
                ClassificationResult::failed(e.to_string())
            }
        };

        if file.is_raw_image {
            result.override_strategy(
                Strategy::SingleDocument,
                "Raw image: always processed as a single document",
            );
        }
        result.confidence = result.confidence.clamp(0.0, 1.0);

        tracing::debug!(
            file = %file.filename(),
            strategy = %result.strategy,
            confidence = result.confidence,
            single = result.single_score,
            batch = result.batch_score,
            "File classified"
        );
        result
    }

    fn try_analyze(&self, file: &IntakeFile) -> Result<ClassificationResult, DetectionError> {
        if file.size_bytes == 0 {
            return Err(DetectionError::EmptyFile(file.filename()));
        }
        if file.page_count == 0 && !file.is_raw_image {
            return Err(DetectionError::NoPages(file.filename()));
        }

        let mut scores = score_metadata(file);
        let mut rotation_angle = None;

        let sample = match (&self.rotation, file.is_raw_image) {
            (Some(classifier), true) => {
                let image = image::open(file.path())
                    .map_err(|e| DetectionError::Image(format!("{}: {e}", file.filename())))?;
                let verdict = classifier.evaluate(&image);
                rotation_angle = Some(verdict.angle.degrees());
                scores.reasons.push(format!(
                    "Rotation trial: {} degrees at {:.2} confidence",
                    verdict.angle.degrees(),
                    verdict.confidence
                ));
                verdict.text
            }
            _ => sample_content(self.pages.as_ref(), file, &mut scores.reasons),
        };

        score_content(&sample, &mut scores);

        let (strategy, confidence) = self.policy.decide(&scores);
        scores.reasons.push(format!(
            "Heuristic decision: {strategy} (single {} vs batch {}, confidence {confidence:.2})",
            scores.single, scores.batch
        ));

        let mut result = ClassificationResult {
            strategy,
            confidence,
            reasons: scores.reasons,
            single_score: scores.single,
            batch_score: scores.batch,
            rotation_angle,
            oracle: None,
        };

        if let Some(oracle) = &self.oracle {
            if sample.trim().chars().count() >= MIN_CONTENT_CHARS {
                self.consult_oracle(oracle, file, sample, &mut result);
            }
        }

        Ok(result)
    }

    fn consult_oracle(
        &self,
        oracle: &Arc<dyn ClassificationOracle>,
        file: &IntakeFile,
        sample: String,
        result: &mut ClassificationResult,
    ) {
        let request = OracleRequest {
            content_sample: sample,
            filename: file.filename(),
            page_count: file.page_count,
            file_size: file.size_bytes,
        };

        match consult_with_timeout(Arc::clone(oracle), request, self.oracle_timeout) {
            Ok(verdict) => {
                if verdict.confidence >= ORACLE_OVERRIDE_THRESHOLD {
                    result.strategy = verdict.classification;
                    result.confidence = verdict.confidence / 100.0;
                    result.reasons.push(format!(
                        "Oracle override: {} at {:.0}% ({})",
                        verdict.classification, verdict.confidence, verdict.reasoning
                    ));
                } else {
                    result.reasons.push(format!(
                        "Oracle suggested {} at {:.0}%, below threshold; heuristic kept",
                        verdict.classification, verdict.confidence
                    ));
                }
                result.oracle = Some(OracleOutcome::Verdict {
                    classification: verdict.classification,
                    confidence: verdict.confidence,
                    reasoning: verdict.reasoning,
                });
            }
            Err(e) => {
                tracing::info!(file = %file.filename(), error = %e, "Oracle unavailable, keeping heuristic result");
                result.reasons.push(format!("Oracle unavailable: {e}"));
                result.oracle = Some(OracleOutcome::Unavailable {
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detection::oracle::MockOracle;
    use crate::pipeline::detection::sampling::InMemoryPageText;
    use crate::pipeline::extraction::ocr::MockOcrEngine;
    use image::{DynamicImage, ImageBuffer, Luma};
    use std::time::Instant;

    const MB: u64 = 1024 * 1024;

    const BATCH_TEXT: &str = "Invoice number 1001, page 1 of 1, bill to ACME Corp.\n\
        Invoice number 2002, page 1 of 1, bill to Globex.\n\
        Invoice number 3003, page 1 of 1, bill to Initech for services.";

    fn pdf(name: &str, pages: u32, size: u64) -> IntakeFile {
        IntakeFile::new(format!("/intake/{name}"), size, pages, false)
    }

    fn with_text(file: &IntakeFile, text: &str) -> Arc<InMemoryPageText> {
        let mut source = InMemoryPageText::new();
        source.insert(file.path(), vec![text.to_string(); file.page_count as usize]);
        Arc::new(source)
    }

    #[test]
    fn short_pdf_is_single() {
        let result = DocumentTypeDetector::default().analyze(&pdf("memo.pdf", 2, MB));
        assert_eq!(result.strategy, Strategy::SingleDocument);
        assert!(result.confidence > 0.0 && result.confidence <= 1.0);
        assert!(!result.reasons.is_empty());
    }

    #[test]
    fn long_large_scan_is_batch() {
        let result = DocumentTypeDetector::default().analyze(&pdf("scan_007.pdf", 60, 90 * MB));
        assert_eq!(result.strategy, Strategy::BatchScan);
        assert_eq!(result.batch_score, 10);
    }

    #[test]
    fn few_pages_never_go_to_batch_on_metadata_alone() {
        let detector = DocumentTypeDetector::default();
        for pages in 1..=3 {
            for size in [MB / 2, 3 * MB, 20 * MB] {
                let result = detector.analyze(&pdf("untitled.pdf", pages, size));
                assert_eq!(result.strategy, Strategy::SingleDocument, "{pages} pages, {size} bytes");
            }
        }
    }

    #[test]
    fn empty_file_fails_soft() {
        let result = DocumentTypeDetector::default().analyze(&pdf("empty.pdf", 1, 0));
        assert_eq!(result.strategy, Strategy::BatchScan);
        assert_eq!(result.confidence, 0.0);
        assert!(result.reasons[0].contains("empty"));
    }

    #[test]
    fn content_can_tip_to_batch() {
        let file = pdf("documents.pdf", 3, 2 * MB);
        let detector = DocumentTypeDetector::new(with_text(&file, BATCH_TEXT));
        let result = detector.analyze(&file);
        // 3 + 1 single against 2 batch fails the margin
        assert_eq!((result.single_score, result.batch_score), (4, 2));
        assert_eq!(result.strategy, Strategy::BatchScan);
    }

    #[test]
    fn confident_oracle_overrides_heuristic() {
        let file = pdf("documents.pdf", 3, 2 * MB);
        let detector = DocumentTypeDetector::new(with_text(&file, BATCH_TEXT)).with_oracle(
            Arc::new(MockOracle::verdict(Strategy::SingleDocument, 90.0)),
            Duration::from_secs(1),
        );
        let result = detector.analyze(&file);
        assert_eq!(result.strategy, Strategy::SingleDocument);
        assert!((result.confidence - 0.9).abs() < 1e-6);
        assert!(result.reasons.iter().any(|r| r.starts_with("Heuristic decision")));
        assert!(result.reasons.iter().any(|r| r.starts_with("Oracle override")));
    }

    #[test]
    fn hesitant_oracle_is_recorded_but_ignored() {
        let file = pdf("documents.pdf", 3, 2 * MB);
        let detector = DocumentTypeDetector::new(with_text(&file, BATCH_TEXT)).with_oracle(
            Arc::new(MockOracle::verdict(Strategy::SingleDocument, 55.0)),
            Duration::from_secs(1),
        );
        let result = detector.analyze(&file);
        assert_eq!(result.strategy, Strategy::BatchScan);
        assert!(matches!(result.oracle, Some(OracleOutcome::Verdict { .. })));
    }

    #[test]
    fn slow_oracle_times_out_and_heuristic_stands() {
        let file = pdf("documents.pdf", 3, 2 * MB);
        let oracle = MockOracle::verdict(Strategy::SingleDocument, 99.0).with_delay(Duration::from_secs(3));
        let detector = DocumentTypeDetector::new(with_text(&file, BATCH_TEXT))
            .with_oracle(Arc::new(oracle), Duration::from_millis(100));

        let started = Instant::now();
        let result = detector.analyze(&file);

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.strategy, Strategy::BatchScan);
        assert!(matches!(result.oracle, Some(OracleOutcome::Unavailable { .. })));
        assert!(result.reasons.iter().any(|r| r.starts_with("Oracle unavailable")));
    }

    #[test]
    fn oracle_skipped_without_content() {
        let detector = DocumentTypeDetector::default().with_oracle(
            Arc::new(MockOracle::failing("should not be called")),
            Duration::from_secs(1),
        );
        let result = detector.analyze(&pdf("memo.pdf", 2, MB));
        assert!(result.oracle.is_none());
    }

    #[test]
    fn raw_image_is_always_single() {
        let detector = DocumentTypeDetector::default().with_oracle(
            Arc::new(MockOracle::verdict(Strategy::BatchScan, 100.0)),
            Duration::from_secs(1),
        );
        // Large, oddly named and unreadable: every rule points to batch
        let file = IntakeFile::new("/intake/batch_0001.jpg", 80 * MB, 1, true);
        let result = detector.analyze(&file);
        assert_eq!(result.strategy, Strategy::SingleDocument);
        assert!(result.reasons.last().unwrap().starts_with("Raw image"));
    }

    #[test]
    fn zero_byte_raw_image_is_still_single() {
        let file = IntakeFile::new("/intake/photo.png", 0, 1, true);
        let result = DocumentTypeDetector::default().analyze(&file);
        assert_eq!(result.strategy, Strategy::SingleDocument);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn raw_image_rotation_supplies_angle_and_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        let buf = ImageBuffer::from_fn(16, 16, |_, _| Luma([200u8]));
        DynamicImage::ImageLuma8(buf).save(&path).unwrap();
        let size = std::fs::metadata(&path).unwrap().len();

        let ocr = MockOcrEngine::new(BATCH_TEXT, 0.9);
        let detector = DocumentTypeDetector::default()
            .with_rotation(RotationClassifier::new(Arc::new(ocr)));
        let result = detector.analyze(&IntakeFile::new(&path, size, 1, true));

        assert_eq!(result.rotation_angle, Some(0));
        // Content scoring ran on the OCR text
        assert_eq!(result.batch_score, 2);
        assert_eq!(result.strategy, Strategy::SingleDocument);
    }
}
