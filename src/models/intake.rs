use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One file handed to the engine for routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntakeFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub page_count: u32,
    /// JPEG/PNG/TIFF/HEIC straight from a camera or scanner, not wrapped in a PDF.
    pub is_raw_image: bool,
}

impl IntakeFile {
    pub fn new(path: impl Into<PathBuf>, size_bytes: u64, page_count: u32, is_raw_image: bool) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            page_count,
            is_raw_image,
        }
    }

    /// File name used as the key for per-file overrides.
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string()
    }

    /// Lowercased file stem, for filename heuristics.
    pub fn stem_lowercase(&self) -> String {
        self.path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_and_stem() {
        let file = IntakeFile::new("/in/Invoice_2024.PDF", 1_000, 2, false);
        assert_eq!(file.filename(), "Invoice_2024.PDF");
        assert_eq!(file.stem_lowercase(), "invoice_2024");
    }

    #[test]
    fn size_mb_uses_binary_megabytes() {
        let file = IntakeFile::new("a.pdf", 3 * 1024 * 1024, 1, false);
        assert!((file.size_mb() - 3.0).abs() < f64::EPSILON);
    }
}
