//! Semantic-strategy split-point scoring, refinement, and heading-body
//! merge (§4.5 "Strategy `semantic`" and "Scoring").

use super::elements::{Element, ElementKind};

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ScorerConfig {
    #[serde(default = "super::default_min_length")]
    pub min_length: usize,
    #[serde(default = "super::default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_min_split_score")]
    pub min_split_score: f64,
    #[serde(default = "default_heading_bonus")]
    pub heading_bonus: f64,
    #[serde(default = "default_sentence_end_bonus")]
    pub sentence_end_bonus: f64,
    #[serde(default = "default_sentence_integrity_weight")]
    pub sentence_integrity_weight: f64,
    #[serde(default = "default_heading_after_penalty")]
    pub heading_after_penalty: f64,
    #[serde(default = "default_length_score_factor")]
    pub length_score_factor: f64,
    #[serde(default = "default_heading_cooldown_elements")]
    pub heading_cooldown_elements: usize,
    #[serde(default = "default_search_window")]
    pub search_window: usize,
    #[serde(default = "default_force_split_before_heading")]
    pub force_split_before_heading: bool,
}

fn default_min_split_score() -> f64 {
    7.0
}
fn default_heading_bonus() -> f64 {
    10.0
}
fn default_sentence_end_bonus() -> f64 {
    6.0
}
fn default_sentence_integrity_weight() -> f64 {
    8.0
}
fn default_heading_after_penalty() -> f64 {
    12.0
}
fn default_length_score_factor() -> f64 {
    100.0
}
fn default_heading_cooldown_elements() -> usize {
    2
}
fn default_search_window() -> usize {
    5
}
fn default_force_split_before_heading() -> bool {
    true
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            min_length: super::default_min_length(),
            max_length: super::default_max_length(),
            min_split_score: default_min_split_score(),
            heading_bonus: default_heading_bonus(),
            sentence_end_bonus: default_sentence_end_bonus(),
            sentence_integrity_weight: default_sentence_integrity_weight(),
            heading_after_penalty: default_heading_after_penalty(),
            length_score_factor: default_length_score_factor(),
            heading_cooldown_elements: default_heading_cooldown_elements(),
            search_window: default_search_window(),
            force_split_before_heading: default_force_split_before_heading(),
        }
    }
}

/// Select element indices (0-based, meaning "split before this element")
/// at which to insert a marker.
pub fn select_split_points(elements: &[Element], cfg: &ScorerConfig) -> Vec<usize> {
    let mut splits = Vec::new();
    let mut current_length = 0usize;
    let mut cooldown = 0usize;
    let mut since_last_split = 0usize;
    let mut last_was_heading = false;

    for (i, el) in elements.iter().enumerate() {
        let len = el.text.chars().count();

        if el.is_heading() && i > 0 {
            if cfg.force_split_before_heading {
                splits.push(i);
                since_last_split = 0;
            }
            current_length = 0;
            cooldown = cfg.heading_cooldown_elements;
            last_was_heading = true;
            continue;
        }

        current_length += len;
        since_last_split += 1;

        if cooldown > 0 {
            cooldown -= 1;
            last_was_heading = false;
            continue;
        }

        if i == 0 {
            last_was_heading = false;
            continue;
        }

        let mut score = 0.0f64;
        if el.is_heading() {
            score += cfg.heading_bonus;
        }
        if el.ends_with_sentence_terminator() {
            score += cfg.sentence_end_bonus;
        }
        let prior_text = elements[i - 1].text.as_str();
        if super::sentence::is_sentence_boundary(prior_text, &el.text) {
            score += cfg.sentence_integrity_weight;
        } else {
            score -= 10.0;
        }
        if matches!(el.kind, ElementKind::Table | ElementKind::Code) {
            score += 6.0;
        }
        if last_was_heading {
            score -= cfg.heading_after_penalty;
        }
        if current_length >= cfg.min_length {
            let term = (current_length - cfg.min_length) as f64 / cfg.length_score_factor;
            score += term.min(4.0);
        } else if (current_length as f64) < 0.7 * cfg.min_length as f64 {
            score -= 5.0;
        }
        if since_last_split < 3 {
            score -= 8.0;
        }
        if current_length > cfg.max_length {
            score += 4.0;
        }

        if score >= cfg.min_split_score && i > 0 {
            splits.push(i);
            current_length = 0;
            since_last_split = 0;
        } else if (current_length as f64) > 1.5 * cfg.max_length as f64 {
            if let Some(idx) = find_nearest_sentence_boundary(elements, i, cfg.search_window) {
                splits.push(idx);
                current_length = 0;
                since_last_split = 0;
            } else if since_last_split >= 3 {
                splits.push(i);
                current_length = 0;
                since_last_split = 0;
            }
        }

        last_was_heading = false;
    }

    refine_and_dedupe(elements, splits, cfg.search_window)
}

fn find_nearest_sentence_boundary(elements: &[Element], around: usize, window: usize) -> Option<usize> {
    let lo = around.saturating_sub(window);
    let hi = (around + window).min(elements.len().saturating_sub(1));
    let mut best: Option<(usize, usize)> = None;
    for idx in lo..=hi {
        if idx == 0 {
            continue;
        }
        if super::sentence::is_sentence_boundary(&elements[idx - 1].text, &elements[idx].text) {
            let dist = idx.abs_diff(around);
            if best.map(|(_, d)| dist < d).unwrap_or(true) {
                best = Some((idx, dist));
            }
        }
    }
    best.map(|(idx, _)| idx)
}

/// Shift mid-sentence split points to the nearest sentence boundary within
/// `search_window`, drop heading-body splits, dedupe and sort.
fn refine_and_dedupe(elements: &[Element], splits: Vec<usize>, search_window: usize) -> Vec<usize> {
    let mut refined: Vec<usize> = splits
        .into_iter()
        .map(|idx| {
            if idx == 0 || idx >= elements.len() {
                return idx;
            }
            let before = &elements[idx - 1];
            let after = &elements[idx];
            if before.is_heading() || after.is_heading() {
                return idx;
            }
            if super::sentence::is_sentence_boundary(&before.text, &after.text) {
                idx
            } else {
                find_nearest_sentence_boundary(elements, idx, search_window).unwrap_or(idx)
            }
        })
        .collect();

    refined.sort_unstable();
    refined.dedup();

    refined
        .into_iter()
        .filter(|&idx| !splits_between_heading_and_body(elements, idx))
        .collect()
}

fn splits_between_heading_and_body(elements: &[Element], idx: usize) -> bool {
    if idx == 0 || idx >= elements.len() {
        return false;
    }
    elements[idx - 1].is_heading() && matches!(elements[idx].kind, ElementKind::Paragraph | ElementKind::List | ElementKind::Table | ElementKind::Blockquote | ElementKind::Code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splitter::elements::scan_elements;

    #[test]
    fn never_splits_between_heading_and_first_content() {
        let text = "# Title\nFirst paragraph body continues here with enough content to matter.";
        let elements = scan_elements(text);
        let splits = select_split_points(&elements, &ScorerConfig::default());
        assert!(!splits.iter().any(|&idx| splits_between_heading_and_body(&elements, idx)));
    }

    #[test]
    fn long_document_produces_multiple_splits() {
        let mut text = String::new();
        for i in 0..50 {
            text.push_str(&format!("## Section {i}\n"));
            text.push_str(&"Sentence content here. ".repeat(40));
            text.push('\n');
        }
        let elements = scan_elements(&text);
        let splits = select_split_points(&elements, &ScorerConfig::default());
        assert!(!splits.is_empty());
    }
}
