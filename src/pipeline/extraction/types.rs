use image::DynamicImage;
use serde::{Deserialize, Serialize};

use super::OcrError;

/// Clockwise page rotation tried by the rotation classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Trial order. Ties resolve to the earliest entry.
    pub const ALL: [Rotation; 4] = [Rotation::Deg0, Rotation::Deg90, Rotation::Deg180, Rotation::Deg270];

    pub fn degrees(&self) -> u16 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    pub fn from_degrees(degrees: u16) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Self::Deg0),
            90 => Some(Self::Deg90),
            180 => Some(Self::Deg180),
            270 => Some(Self::Deg270),
            _ => None,
        }
    }

    /// The rotation that undoes this one.
    pub fn inverse(&self) -> Self {
        match self {
            Self::Deg0 => Self::Deg0,
            Self::Deg90 => Self::Deg270,
            Self::Deg180 => Self::Deg180,
            Self::Deg270 => Self::Deg90,
        }
    }
}

/// Per-word OCR output
#[derive(Debug, Clone)]
pub struct OcrWordResult {
    pub text: String,
    pub confidence: f32,
}

/// Raw OCR result from the engine
#[derive(Debug, Clone, Default)]
pub struct OcrPageResult {
    pub text: String,
    pub word_confidences: Vec<OcrWordResult>,
}

impl OcrPageResult {
    /// Mean of per-token confidences; 0.0 when no tokens were recognized.
    pub fn mean_confidence(&self) -> f32 {
        if self.word_confidences.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.word_confidences.iter().map(|w| w.confidence).sum();
        sum / self.word_confidences.len() as f32
    }
}

/// OCR engine abstraction (allows mocking for tests).
///
/// `angle` is a clockwise rotation the engine applies before recognition.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: &DynamicImage, angle: Rotation) -> Result<OcrPageResult, OcrError>;
}
