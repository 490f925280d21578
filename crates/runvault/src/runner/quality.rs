//! Heuristic OCR quality report, written as `quality.json` per document.

use serde::{Deserialize, Serialize};

pub const MIN_PAGE_CHARS: usize = 200;
const MIN_ALPHA_RATIO: f64 = 0.2;
const MAX_PLACEHOLDER_RATIO: f64 = 0.7;
const REPLACEMENT_CHAR: char = '\u{FFFD}';

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub warnings: Vec<String>,
    /// 1-based page numbers with at least one warning.
    pub bad_pages: Vec<usize>,
}

pub fn evaluate_pages(pages: &[String]) -> QualityReport {
    let mut report = QualityReport::default();
    for (index, markdown) in pages.iter().enumerate() {
        let page = index + 1;
        let warnings = page_warnings(markdown, page);
        if !warnings.is_empty() {
            report.warnings.extend(warnings);
            report.bad_pages.push(page);
        }
    }
    report
}

fn page_warnings(markdown: &str, page: usize) -> Vec<String> {
    let text = markdown.trim();
    let length = text.chars().count();
    let mut warnings = Vec::new();

    if length < MIN_PAGE_CHARS {
        warnings.push(format!(
            "Page {}: markdown length below threshold ({} < {}).",
            page, length, MIN_PAGE_CHARS
        ));
    }
    if length > 0 {
        let letters = text.chars().filter(|c| c.is_alphabetic()).count();
        let ratio = letters as f64 / length as f64;
        if ratio < MIN_ALPHA_RATIO {
            warnings.push(format!("Page {}: low alphabetic ratio ({:.2}).", page, ratio));
        }
        let replacements = text.chars().filter(|c| *c == REPLACEMENT_CHAR).count();
        if replacements > 0 {
            warnings.push(format!(
                "Page {}: contains replacement characters ({}).",
                page, replacements
            ));
        }
    }
    if mostly_placeholders(text) {
        warnings.push(format!("Page {}: mostly placeholder-only OCR content.", page));
    }
    warnings
}

/// Image or link placeholders on more than 70% of the non-empty lines.
fn mostly_placeholders(text: &str) -> bool {
    let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.is_empty() {
        return false;
    }
    let placeholders = lines
        .iter()
        .filter(|line| (line.starts_with("![") || line.starts_with('[')) && line.contains("]("))
        .count();
    placeholders as f64 / lines.len() as f64 > MAX_PLACEHOLDER_RATIO
}
