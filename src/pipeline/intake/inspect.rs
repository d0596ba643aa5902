//! Builds an `IntakeFile` from a path on disk.
//!
//! Page counts for PDFs come from a raw scan of the object table: page
//! objects are `/Type /Page` dictionaries (the tree root is `/Type /Pages`).
//! When no page objects are visible (compressed object streams), the largest
//! `/Count` in the page tree is used instead.

use std::path::Path;
use std::sync::OnceLock;

use regex::bytes::Regex;

use super::format::{detect_format, FileCategory};
use super::IntakeError;
use crate::models::IntakeFile;

fn page_object_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/Type\s*/Page(?:[^s]|$)").expect("valid page regex"))
}

fn page_count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/Count\s+(\d+)").expect("valid count regex"))
}

/// Inspect a file: size, page count, and whether it is a raw image.
pub fn inspect(path: &Path) -> Result<IntakeFile, IntakeError> {
    let format = detect_format(path)?;
    if format.file_size_bytes == 0 {
        return Err(IntakeError::EmptyFile(path.display().to_string()));
    }

    let (page_count, is_raw_image) = match format.category {
        FileCategory::Image => (1, true),
        FileCategory::Pdf => {
            let bytes = std::fs::read(path)?;
            (count_pdf_pages(&bytes), false)
        }
        FileCategory::Unsupported => {
            return Err(IntakeError::UnsupportedFormat(format.mime_type));
        }
    };

    tracing::debug!(
        file = %path.display(),
        page_count,
        is_raw_image,
        size_bytes = format.file_size_bytes,
        "Inspected intake file"
    );

    Ok(IntakeFile::new(path, format.file_size_bytes, page_count, is_raw_image))
}

/// Count pages in raw PDF bytes. Never returns less than 1.
pub fn count_pdf_pages(bytes: &[u8]) -> u32 {
    let objects = page_object_re().find_iter(bytes).count() as u32;
    if objects > 0 {
        return objects;
    }

    page_count_re()
        .captures_iter(bytes)
        .filter_map(|caps| std::str::from_utf8(&caps[1]).ok()?.parse::<u32>().ok())
        .max()
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_pdf(pages: usize) -> Vec<u8> {
        let mut body = String::from("%PDF-1.4\n1 0 obj << /Type /Pages /Count ");
        body.push_str(&pages.to_string());
        body.push_str(" >> endobj\n");
        for i in 0..pages {
            body.push_str(&format!("{} 0 obj << /Type /Page /Parent 1 0 R >> endobj\n", i + 2));
        }
        body.into_bytes()
    }

    #[test]
    fn counts_page_objects_not_page_tree() {
        assert_eq!(count_pdf_pages(&fake_pdf(7)), 7);
    }

    #[test]
    fn falls_back_to_count_entry() {
        let bytes = b"%PDF-1.5\n<< /Type /Pages /Kids [] /Count 42 >>";
        assert_eq!(count_pdf_pages(bytes), 42);
    }

    #[test]
    fn unreadable_pdf_counts_one_page() {
        assert_eq!(count_pdf_pages(b"%PDF-1.7 garbage"), 1);
    }

    #[test]
    fn inspect_pdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan_0001.pdf");
        std::fs::write(&path, fake_pdf(3)).unwrap();
        let file = inspect(&path).unwrap();
        assert_eq!(file.page_count, 3);
        assert!(!file.is_raw_image);
        assert!(file.size_bytes > 0);
    }

    #[test]
    fn inspect_image_is_single_page_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]).unwrap();
        let file = inspect(&path).unwrap();
        assert_eq!(file.page_count, 1);
        assert!(file.is_raw_image);
    }

    #[test]
    fn inspect_rejects_empty_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.pdf");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(inspect(&empty), Err(IntakeError::EmptyFile(_))));

        let exe = dir.path().join("tool.exe");
        std::fs::write(&exe, [0x4D, 0x5A, 0x90, 0x00]).unwrap();
        assert!(matches!(inspect(&exe), Err(IntakeError::UnsupportedFormat(_))));
    }
}
