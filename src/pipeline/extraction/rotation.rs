//! Rotation-aware OCR scoring.
//!
//! Scanned pages arrive sideways or upside down often enough that a single
//! OCR pass is misleading. Each of the four quarter turns is recognized and
//! scored; the best-scoring orientation wins.

use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use super::types::{OcrEngine, OcrPageResult, Rotation};

/// Text longer than this earns the length bonus.
const LONG_TEXT_CHARS: usize = 50;
/// More words than this earns the word-count bonus.
const MANY_WORDS: usize = 10;
const LONG_TEXT_BONUS: f32 = 1.10;
const MANY_WORDS_BONUS: f32 = 1.05;

/// Outcome of a rotation trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationVerdict {
    pub angle: Rotation,
    /// Adjusted confidence of the winning angle, clamped to [0, 1].
    pub confidence: f32,
    pub text: String,
}

impl RotationVerdict {
    fn nothing_recognized() -> Self {
        Self {
            angle: Rotation::Deg0,
            confidence: 0.0,
            text: String::new(),
        }
    }
}

/// Picks the orientation whose OCR output is most trustworthy.
pub struct RotationClassifier {
    engine: Arc<dyn OcrEngine>,
}

impl RotationClassifier {
    pub fn new(engine: Arc<dyn OcrEngine>) -> Self {
        Self { engine }
    }

    /// Try every quarter turn and keep the best. Never fails: an angle whose
    /// OCR errors is skipped, and if every angle errors the verdict is
    /// `(0°, 0.0, "")`.
    pub fn evaluate(&self, image: &DynamicImage) -> RotationVerdict {
        let mut best: Option<(Rotation, f32, String)> = None;

        for angle in Rotation::ALL {
            let page = match self.engine.recognize(image, angle) {
                Ok(page) => page,
                Err(e) => {
                    tracing::debug!(angle = angle.degrees(), error = %e, "OCR failed at angle, skipping");
                    continue;
                }
            };

            let score = adjusted_confidence(&page);
            tracing::trace!(angle = angle.degrees(), score, "Rotation trial scored");

            // Strictly greater: ties keep the earlier angle
            let better = match &best {
                Some((_, best_score, _)) => score > *best_score,
                None => true,
            };
            if better {
                best = Some((angle, score, page.text));
            }
        }

        match best {
            Some((angle, score, text)) => RotationVerdict {
                angle,
                confidence: score.clamp(0.0, 1.0),
                text,
            },
            None => RotationVerdict::nothing_recognized(),
        }
    }
}

/// Mean token confidence with the length and word-count bonuses applied.
pub fn adjusted_confidence(page: &OcrPageResult) -> f32 {
    let mut score = page.mean_confidence();
    if page.text.trim().chars().count() > LONG_TEXT_CHARS {
        score *= LONG_TEXT_BONUS;
    }
    if page.text.split_whitespace().count() > MANY_WORDS {
        score *= MANY_WORDS_BONUS;
    }
    score
}

/// Rotate an image clockwise by `angle`.
pub fn rotate_image(image: &DynamicImage, angle: Rotation) -> DynamicImage {
    match angle {
        Rotation::Deg0 => image.clone(),
        Rotation::Deg90 => image.rotate90(),
        Rotation::Deg180 => image.rotate180(),
        Rotation::Deg270 => image.rotate270(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::extraction::ocr::{page_from_text, MockOcrEngine};
    use crate::pipeline::extraction::OcrError;
    use image::{GenericImageView, ImageBuffer, Luma};

    const UPRIGHT_TEXT: &str =
        "Quarterly statement for account 88-1200 covering the period ending March with totals enclosed";

    /// Reads text only when the dark marker lands in the top-left corner,
    /// which is where it sits on an upright page.
    struct MarkerOcr;

    impl OcrEngine for MarkerOcr {
        fn recognize(&self, image: &DynamicImage, angle: Rotation) -> Result<OcrPageResult, OcrError> {
            let turned = rotate_image(image, angle);
            let corner = turned.get_pixel(0, 0);
            if corner.0[0] < 128 {
                Ok(page_from_text(UPRIGHT_TEXT, 0.91))
            } else {
                Ok(page_from_text("~ ,, ;", 0.22))
            }
        }
    }

    /// Fails on a chosen set of angles.
    struct FlakyOcr {
        failing: Vec<Rotation>,
    }

    impl OcrEngine for FlakyOcr {
        fn recognize(&self, _image: &DynamicImage, angle: Rotation) -> Result<OcrPageResult, OcrError> {
            if self.failing.contains(&angle) {
                return Err(OcrError::OcrProcessing(format!("angle {}", angle.degrees())));
            }
            Ok(page_from_text("short text", 0.5 + angle.degrees() as f32 / 1000.0))
        }
    }

    fn upright_page() -> DynamicImage {
        // Landscape so quarter turns change the geometry
        let buf = ImageBuffer::from_fn(40, 20, |x, y| {
            if x < 3 && y < 3 {
                Luma([0u8])
            } else {
                Luma([255u8])
            }
        });
        DynamicImage::ImageLuma8(buf)
    }

    #[test]
    fn rotated_page_resolves_to_inverse_angle() {
        let classifier = RotationClassifier::new(Arc::new(MarkerOcr));
        let scanned_sideways = rotate_image(&upright_page(), Rotation::Deg90);

        let verdict = classifier.evaluate(&scanned_sideways);

        assert_eq!(verdict.angle, Rotation::Deg90.inverse());
        assert!(verdict.confidence > 0.0);
        assert_eq!(verdict.text, UPRIGHT_TEXT);
    }

    #[test]
    fn upright_page_stays_at_zero() {
        let classifier = RotationClassifier::new(Arc::new(MarkerOcr));
        let verdict = classifier.evaluate(&upright_page());
        assert_eq!(verdict.angle, Rotation::Deg0);
    }

    #[test]
    fn ties_favor_first_angle() {
        let classifier = RotationClassifier::new(Arc::new(MockOcrEngine::new("same everywhere", 0.8)));
        let verdict = classifier.evaluate(&upright_page());
        assert_eq!(verdict.angle, Rotation::Deg0);
        assert!((verdict.confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn failed_angles_are_excluded() {
        let engine = FlakyOcr {
            failing: vec![Rotation::Deg270],
        };
        let verdict = RotationClassifier::new(Arc::new(engine)).evaluate(&upright_page());
        // 180 scores highest among the angles that succeeded
        assert_eq!(verdict.angle, Rotation::Deg180);
    }

    #[test]
    fn all_angles_failing_yields_empty_verdict() {
        let engine = FlakyOcr {
            failing: Rotation::ALL.to_vec(),
        };
        let verdict = RotationClassifier::new(Arc::new(engine)).evaluate(&upright_page());
        assert_eq!(verdict, RotationVerdict::nothing_recognized());
    }

    #[test]
    fn bonuses_apply_for_long_wordy_text() {
        let page = page_from_text(UPRIGHT_TEXT, 0.8);
        let expected = 0.8 * LONG_TEXT_BONUS * MANY_WORDS_BONUS;
        assert!((adjusted_confidence(&page) - expected).abs() < 1e-6);

        let short = page_from_text("two words", 0.8);
        assert!((adjusted_confidence(&short) - 0.8).abs() < 1e-6);
    }

    #[test]
    fn reported_confidence_is_clamped() {
        let classifier = RotationClassifier::new(Arc::new(MockOcrEngine::new(UPRIGHT_TEXT, 0.99)));
        let verdict = classifier.evaluate(&upright_page());
        assert!(verdict.confidence <= 1.0);
    }
}
