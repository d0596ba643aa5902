use image::DynamicImage;

use super::types::{OcrEngine, OcrPageResult, OcrWordResult, Rotation};
use super::OcrError;

/// Mock OCR engine for unit testing without a real recognizer.
/// Returns the same text at every angle.
pub struct MockOcrEngine {
    pub text: String,
    pub confidence: f32,
}

impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self {
            text: text.to_string(),
            confidence,
        }
    }
}

impl OcrEngine for MockOcrEngine {
    fn recognize(&self, _image: &DynamicImage, _angle: Rotation) -> Result<OcrPageResult, OcrError> {
        Ok(page_from_text(&self.text, self.confidence))
    }
}

/// Build an `OcrPageResult` where every whitespace token carries `confidence`.
pub fn page_from_text(text: &str, confidence: f32) -> OcrPageResult {
    let word_confidences = text
        .split_whitespace()
        .map(|w| OcrWordResult {
            text: w.to_string(),
            confidence,
        })
        .collect();

    OcrPageResult {
        text: text.to_string(),
        word_confidences,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> DynamicImage {
        DynamicImage::new_luma8(4, 4)
    }

    #[test]
    fn mock_ocr_returns_configured_text() {
        let engine = MockOcrEngine::new("Invoice 2024-118", 0.92);
        let result = engine.recognize(&blank(), Rotation::Deg0).unwrap();
        assert_eq!(result.text, "Invoice 2024-118");
        assert!((result.mean_confidence() - 0.92).abs() < f32::EPSILON);
    }

    #[test]
    fn mock_ocr_word_confidences() {
        let engine = MockOcrEngine::new("Total amount due", 0.85);
        let result = engine.recognize(&blank(), Rotation::Deg180).unwrap();
        assert_eq!(result.word_confidences.len(), 3);
        assert_eq!(result.word_confidences[0].text, "Total");
    }
}
