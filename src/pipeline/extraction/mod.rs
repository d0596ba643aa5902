pub mod types;
pub mod ocr;
pub mod rotation;

pub use types::*;
pub use ocr::*;
pub use rotation::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OCR engine initialization failed: {0}")]
    OcrInit(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("Image decoding failed: {0}")]
    ImageDecode(String),
}
