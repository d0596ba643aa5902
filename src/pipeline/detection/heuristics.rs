//! Conservative scoring of metadata and sampled content.
//!
//! Each rule adds points to one side and leaves a line in the trail. The
//! decision policy only returns `single_document` when single clearly wins;
//! anything ambiguous is routed as a batch scan.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{IntakeFile, Strategy};

const SMALL_FILE_MB: f64 = 5.0;
const LARGE_FILE_MB: f64 = 50.0;

/// Content samples shorter than this are not scored (or sent to the oracle).
pub const MIN_CONTENT_CHARS: usize = 100;

/// Phrases that suggest one continuous document.
const SINGLE_PHRASES: &[&str] = &[
    "page 2 of",
    "page 3 of",
    "continued",
    "table of contents",
    "appendix",
    "see attached",
    "sincerely",
    "in witness whereof",
    "terms and conditions",
];

/// Phrases that repeat once per document in a stack of unrelated documents.
const BATCH_PHRASES: &[&str] = &[
    "page 1 of",
    "invoice number",
    "invoice #",
    "statement date",
    "bill to",
    "to whom it may concern",
    "dear ",
    "receipt",
    "account number",
];

fn single_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(invoice|contract|report|receipt|letter|memo|policy)[ _-]?\d+")
            .expect("static regex")
    })
}

fn batch_name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(scan|batch|combined|archive)[ _-]?\d+").expect("static regex")
    })
}

/// Running single/batch tally with its rationale trail.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeuristicScores {
    pub single: u32,
    pub batch: u32,
    pub reasons: Vec<String>,
}

impl HeuristicScores {
    fn single(&mut self, points: u32, reason: String) {
        self.single += points;
        self.reasons.push(format!("+{points} single: {reason}"));
    }

    fn batch(&mut self, points: u32, reason: String) {
        self.batch += points;
        self.reasons.push(format!("+{points} batch: {reason}"));
    }
}

/// True when the filename looks like one named document.
pub fn filename_hints_single(file: &IntakeFile) -> bool {
    let name = file.filename();
    single_name_pattern().is_match(&name) || file.stem_lowercase().contains("single")
}

/// Page-count, size and filename rules.
pub fn score_metadata(file: &IntakeFile) -> HeuristicScores {
    let mut scores = HeuristicScores::default();
    let pages = file.page_count;
    let name = file.filename();

    match pages {
        0..=3 => scores.single(3, format!("{pages} page(s), short enough to be one document")),
        4..=15 if filename_hints_single(file) => {
            scores.single(2, format!("{pages} pages with a single-document filename"))
        }
        4..=15 => scores.batch(1, format!("{pages} pages without a filename hint")),
        16..=24 => scores.batch(2, format!("{pages} pages, long for one document")),
        _ => scores.batch(4, format!("{pages} pages, typical of a batch scan")),
    }

    let size_mb = file.size_mb();
    if size_mb > LARGE_FILE_MB {
        scores.batch(3, format!("{size_mb:.1} MB file"));
    } else if size_mb < SMALL_FILE_MB {
        scores.single(1, format!("{size_mb:.1} MB file"));
    }

    if let Some(m) = single_name_pattern().find(&name) {
        scores.single(2, format!("filename names a document ('{}')", m.as_str()));
    }
    if let Some(m) = batch_name_pattern().find(&name) {
        scores.batch(3, format!("filename names a scan batch ('{}')", m.as_str()));
    }

    scores
}

fn count_phrases(haystack: &str, phrases: &[&str]) -> usize {
    phrases
        .iter()
        .map(|phrase| haystack.matches(phrase).count())
        .sum()
}

/// Indicator-phrase rules over sampled page text.
pub fn score_content(sample: &str, scores: &mut HeuristicScores) {
    if sample.trim().chars().count() < MIN_CONTENT_CHARS {
        scores
            .reasons
            .push("Content sample too short to score".to_string());
        return;
    }

    let lowered = sample.to_lowercase();
    let single_hits = count_phrases(&lowered, SINGLE_PHRASES);
    let batch_hits = count_phrases(&lowered, BATCH_PHRASES);

    if single_hits >= 2 && single_hits > batch_hits {
        scores.single(
            1,
            format!("{single_hits} continuity phrases vs {batch_hits} document-start phrases"),
        );
    } else if batch_hits >= 2 && batch_hits > single_hits {
        scores.batch(
            2,
            format!("{batch_hits} document-start phrases vs {single_hits} continuity phrases"),
        );
    } else {
        scores.reasons.push(format!(
            "Content inconclusive ({single_hits} continuity, {batch_hits} document-start phrases)"
        ));
    }
}

/// Turns scores into a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionPolicy {
    /// Points single must lead batch by.
    pub margin: u32,
    /// Minimum share of the total held by the winning side.
    pub min_confidence: f32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            margin: 2,
            min_confidence: 0.7,
        }
    }
}

impl DecisionPolicy {
    pub fn new(margin: u32, min_confidence: f32) -> Self {
        Self {
            margin,
            min_confidence,
        }
    }

    /// `(strategy, confidence)`; confidence is the winning side's share.
    pub fn decide(&self, scores: &HeuristicScores) -> (Strategy, f32) {
        let total = scores.single + scores.batch;
        if total == 0 {
            return (Strategy::BatchScan, 0.0);
        }

        let confidence = scores.single.max(scores.batch) as f32 / total as f32;
        let strategy = if scores.single >= scores.batch + self.margin
            && confidence >= self.min_confidence
        {
            Strategy::SingleDocument
        } else {
            Strategy::BatchScan
        };
        (strategy, confidence.clamp(0.0, 1.0))
    }
}
