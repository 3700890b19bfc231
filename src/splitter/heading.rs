//! Heading normalization and pattern-based detection shared by both split
//! strategies (§4.5 "Heading normalization").

use std::sync::LazyLock;
use regex::Regex;

static RE_HEADING_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.*)$").unwrap());
static RE_NUMERIC_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*[.)、]?\s*").unwrap());
static RE_PAGE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\d{1,4}\s*$").unwrap());

/// Additional heading-like prose patterns recognized by the `semantic`
/// strategy (Chinese chapter markers, enumerations, parenthesized numerals).
static RE_CHAPTER_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(第[一二三四五六七八九十百千\d]+[章节篇部])").unwrap());
static RE_CN_ENUM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[一二三四五六七八九十]+、").unwrap());
static RE_DOTTED_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{1,2}(\.\d{1,2}){0,3}\s+\S").unwrap());
static RE_PAREN_NUMERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[(（]\d+[)）]").unwrap());

const PROMOTED_MAX_LEN: usize = 80;

/// Normalize contiguous runs of heading lines: the first heading of a run
/// (at the run's minimum level) is promoted to `#`; the rest have a leading
/// numeric prefix stripped if present. Page-number-only lines and form feeds
/// are removed.
pub fn normalize_headings(text: &str) -> String {
    let cleaned: String = text.replace('\x0c', "");
    let lines: Vec<&str> = cleaned.lines().collect();
    let mut out = Vec::with_capacity(lines.len());
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        if RE_PAGE_NUMBER.is_match(line) {
            i += 1;
            continue;
        }
        if RE_HEADING_LINE.is_match(line) {
            let mut run = Vec::new();
            let mut j = i;
            while j < lines.len() {
                if RE_PAGE_NUMBER.is_match(lines[j]) {
                    j += 1;
                    continue;
                }
                if let Some(caps) = RE_HEADING_LINE.captures(lines[j]) {
                    run.push((j, caps[1].len(), caps[2].to_string()));
                    j += 1;
                } else if lines[j].trim().is_empty() {
                    j += 1;
                } else {
                    break;
                }
            }
            if !run.is_empty() {
                let min_level = run.iter().map(|(_, lvl, _)| *lvl).min().unwrap();
                for (idx, (_, _, title)) in run.iter().enumerate() {
                    if idx == 0 {
                        out.push(format!("# {}", title));
                    } else {
                        let stripped = RE_NUMERIC_PREFIX.replace(title, "");
                        out.push(format!("{} {}", "#".repeat(min_level), stripped));
                    }
                }
                i = j;
                continue;
            }
        }
        out.push(line.to_string());
        i += 1;
    }
    out.join("\n")
}

pub fn is_heading_like_prose(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.chars().count() > PROMOTED_MAX_LEN {
        return false;
    }
    if super::elements::ends_with_terminator(trimmed) {
        return false;
    }
    RE_CHAPTER_MARKER.is_match(trimmed)
        || RE_CN_ENUM.is_match(trimmed)
        || RE_DOTTED_PREFIX.is_match(trimmed)
        || RE_PAREN_NUMERAL.is_match(trimmed)
}

/// Promote a paragraph element's text to a heading string if it matches one
/// of the prose heading patterns and a caller-supplied custom regex list.
pub fn promote_if_heading_like(text: &str, custom_patterns: &[Regex]) -> bool {
    if is_heading_like_prose(text) {
        return true;
    }
    let trimmed = text.trim();
    if trimmed.chars().count() > PROMOTED_MAX_LEN || super::elements::ends_with_terminator(trimmed) {
        return false;
    }
    custom_patterns.iter().any(|re| re.is_match(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotes_run_minimum_level_to_h1() {
        let text = "### Intro\n#### Sub\npara";
        let normalized = normalize_headings(text);
        assert!(normalized.starts_with("# Intro"));
    }

    #[test]
    fn strips_numeric_prefix_from_non_first_run_heading() {
        let text = "# Chapter\n## 1.2 Details";
        let normalized = normalize_headings(text);
        assert!(normalized.contains("Details"));
        assert!(!normalized.contains("1.2 Details"));
    }

    #[test]
    fn removes_page_number_only_lines() {
        let normalized = normalize_headings("# H\n42\npara");
        assert!(!normalized.lines().any(|l| l.trim() == "42"));
    }

    #[test]
    fn detects_chinese_chapter_marker_as_heading_like() {
        assert!(is_heading_like_prose("第一章 绪论"));
    }

    #[test]
    fn long_prose_is_not_heading_like() {
        let long = "a".repeat(100);
        assert!(!is_heading_like_prose(&long));
    }
}
