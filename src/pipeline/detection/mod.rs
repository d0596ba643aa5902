//! Document type detection: is an intake file one document, or a stack of
//! documents scanned as one file?
//!
//! Metadata and content heuristics produce a conservative verdict that an
//! optional text-classification oracle may overrule. Raw camera/scanner
//! images are always single documents.

pub mod types;
pub mod heuristics;
pub mod sampling;
pub mod oracle;
pub mod detector;

pub use types::*;
pub use heuristics::{DecisionPolicy, HeuristicScores};
pub use sampling::{InMemoryPageText, NoPageText, PageTextSource};
pub use oracle::{ClassificationOracle, OllamaOracle, OracleError, OracleRequest, OracleVerdict};
pub use detector::DocumentTypeDetector;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("File is empty: {0}")]
    EmptyFile(String),

    #[error("File reports no pages: {0}")]
    NoPages(String),

    #[error("Page text unavailable: {0}")]
    PageText(String),

    #[error("Image could not be loaded: {0}")]
    Image(String),
}
