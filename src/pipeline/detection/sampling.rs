//! Page text sampling for content heuristics.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::models::IntakeFile;

use super::DetectionError;

/// Supplies the text of one page of an intake file.
/// Implementations wrap whatever extraction the host already runs.
pub trait PageTextSource: Send + Sync {
    fn page_text(&self, file: &IntakeFile, page_index: u32) -> Result<String, DetectionError>;
}

/// No content available; detection falls back to metadata alone.
pub struct NoPageText;

impl PageTextSource for NoPageText {
    fn page_text(&self, _file: &IntakeFile, _page_index: u32) -> Result<String, DetectionError> {
        Ok(String::new())
    }
}

/// Pre-extracted page text keyed by file path.
#[derive(Default)]
pub struct InMemoryPageText {
    pages: HashMap<PathBuf, Vec<String>>,
}

impl InMemoryPageText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, pages: Vec<String>) {
        self.pages.insert(path.into(), pages);
    }
}

impl PageTextSource for InMemoryPageText {
    fn page_text(&self, file: &IntakeFile, page_index: u32) -> Result<String, DetectionError> {
        self.pages
            .get(file.path())
            .and_then(|pages| pages.get(page_index as usize))
            .cloned()
            .ok_or_else(|| {
                DetectionError::PageText(format!("{} page {}", file.filename(), page_index + 1))
            })
    }
}

/// Zero-based indices of the sampled pages: first, middle, last.
pub fn sample_indices(page_count: u32) -> Vec<u32> {
    match page_count {
        0 => vec![],
        1 => vec![0],
        2 => vec![0, 1],
        n => vec![0, n / 2, n - 1],
    }
}

/// Concatenated text of the sampled pages. Pages that fail are noted in
/// `reasons` and skipped.
pub fn sample_content(
    source: &dyn PageTextSource,
    file: &IntakeFile,
    reasons: &mut Vec<String>,
) -> String {
    let mut parts = Vec::new();
    for index in sample_indices(file.page_count) {
        match source.page_text(file, index) {
            Ok(text) if !text.trim().is_empty() => parts.push(text),
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(file = %file.filename(), page = index + 1, error = %e, "Page sample unavailable");
                reasons.push(format!("Page {} not sampled: {e}", index + 1));
            }
        }
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_cover_first_middle_last() {
        assert!(sample_indices(0).is_empty());
        assert_eq!(sample_indices(1), vec![0]);
        assert_eq!(sample_indices(2), vec![0, 1]);
        assert_eq!(sample_indices(3), vec![0, 1, 2]);
        assert_eq!(sample_indices(40), vec![0, 20, 39]);
    }

    #[test]
    fn missing_pages_are_annotated_not_fatal() {
        let file = IntakeFile::new("/in/a.pdf", 100, 5, false);
        let mut source = InMemoryPageText::new();
        source.insert("/in/a.pdf", vec!["first".into(), "second".into(), "third".into()]);

        let mut reasons = Vec::new();
        let text = sample_content(&source, &file, &mut reasons);

        // Pages 1 and 3 exist; page 5 does not
        assert_eq!(text, "first\nthird");
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].starts_with("Page 5 not sampled"));
    }

    #[test]
    fn no_page_text_yields_empty_sample() {
        let file = IntakeFile::new("/in/b.pdf", 100, 3, false);
        let mut reasons = Vec::new();
        assert!(sample_content(&NoPageText, &file, &mut reasons).is_empty());
        assert!(reasons.is_empty());
    }
}
