pub mod format;
pub mod inspect;

pub use format::*;
pub use inspect::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("File is empty: {0}")]
    EmptyFile(String),
}
