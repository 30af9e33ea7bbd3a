//! Food label normalization.
//!
//! Detector class names and nutrition table keys are joined case-sensitively,
//! so both sides go through [`normalize_label`] before they meet.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

/// Canonical form of a food label: separators collapsed to single spaces,
/// every word title-cased. `"chicken_breast"` becomes `"Chicken Breast"`.
pub fn normalize_label(raw: &str) -> String {
    static SEPARATOR_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let raw = raw.trim();
    let words: Vec<&str> = match SEPARATOR_RE.get_or_init(|| Regex::new(r"[\s_\-]+").ok()) {
        Some(re) => re.split(raw).collect(),
        None => raw.split(is_separator).collect(),
    };
    words
        .into_iter()
        .filter(|word| !word.is_empty())
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_separator(c: char) -> bool {
    c.is_whitespace() || c == '_' || c == '-'
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|c| c.to_lowercase()))
            .collect(),
        None => String::new(),
    }
}

/// Load the model's class names, one per line. Line index is the class id.
///
/// Blank lines and `#` comments are skipped, so the class id is the index
/// among the remaining lines.
pub fn load_labels(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read labels file {}", path.display()))?;
    let labels = parse_labels(&raw);
    if labels.is_empty() {
        return Err(anyhow!("labels file {} has no entries", path.display()));
    }
    Ok(labels)
}

pub(crate) fn parse_labels(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}
