//! Markdown cleaning pipeline (C3): the rule-driven sanitization pass
//! between OCR output and RAG upload.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::warn;

static RE_HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static RE_CONTROL_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f]").unwrap());
static RE_BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static RE_PAGE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^\s*\d{1,4}\s*$").unwrap());
/// Fallback regex pass for placeholders the tolerant scanner's escape/paren
/// handling didn't already remove (kept as a guard, not the primary path).
static RE_IMAGE_PLACEHOLDER_FALLBACK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!\[.*?\]\(.*?\)").unwrap());

const MIN_CLEANED_LENGTH: usize = 10;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MdCleanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub collapse_blank_lines: bool,
    #[serde(default = "default_true")]
    pub strip_html: bool,
    #[serde(default = "default_true")]
    pub remove_control_chars: bool,
    #[serde(default = "default_true")]
    pub remove_image_placeholders: bool,
    #[serde(default)]
    pub remove_page_numbers: bool,
    #[serde(default)]
    pub remove_watermark: bool,
    #[serde(default)]
    pub watermark_patterns: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanStats {
    pub original_len: usize,
    pub cleaned_len: usize,
    pub rules_applied: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateCleanStats {
    pub total_original: u64,
    pub total_cleaned: u64,
    pub reduction_pct: f64,
    pub file_count: usize,
}

/// Remove `![alt](dest)` occurrences using a scanner tolerant of escaped
/// brackets in `alt` and nested parentheses in `dest`, rejecting any match
/// whose span contains a newline (property 7). Falls back to a simple
/// regex pass afterward as a guard for anything the scanner missed.
pub fn remove_image_placeholders(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] == b'!' && i + 1 < bytes.len() && bytes[i + 1] == b'[' {
            if let Some(end) = scan_placeholder(text, i) {
                i = end;
                continue;
            }
        }
        let ch_len = next_char_len(text, i);
        out.push_str(&text[i..i + ch_len]);
        i += ch_len;
    }
    RE_IMAGE_PLACEHOLDER_FALLBACK.replace_all(&out, "").into_owned()
}

fn next_char_len(text: &str, i: usize) -> usize {
    text[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1)
}

/// Try to scan a full `![alt](dest)` placeholder starting at `start` (the
/// index of `!`). Returns the byte index just past the closing `)` on
/// success.
fn scan_placeholder(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = start + 2; // past "!["
    // alt text: up to an unescaped ']', no raw newline allowed.
    loop {
        if i >= bytes.len() {
            return None;
        }
        match bytes[i] {
            b'\n' => return None,
            b'\\' if i + 1 < bytes.len() => i += 2,
            b']' => {
                i += 1;
                break;
            }
            _ => i += next_char_len(text, i),
        }
    }
    if i >= bytes.len() || bytes[i] != b'(' {
        return None;
    }
    i += 1;
    let mut depth = 1i32;
    loop {
        if i >= bytes.len() {
            return None;
        }
        match bytes[i] {
            b'\n' => return None,
            b'\\' if i + 1 < bytes.len() => i += 2,
            b'(' => {
                depth += 1;
                i += 1;
            }
            b')' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => i += next_char_len(text, i),
        }
    }
}

/// Placeholder substituted for the split marker while stripping HTML tags,
/// since `<!--split-->` would otherwise match the `<[^>]+>` tag pattern.
const SPLIT_MARKER_GUARD: &str = "\u{0}SPLIT_MARKER\u{0}";

fn strip_html_tags(text: &str) -> String {
    let protected = text.replace(crate::models::SPLIT_MARKER, SPLIT_MARKER_GUARD);
    let stripped = RE_HTML_TAG.replace_all(&protected, "").into_owned();
    stripped.replace(SPLIT_MARKER_GUARD, crate::models::SPLIT_MARKER)
}

fn remove_control_chars(text: &str) -> String {
    RE_CONTROL_CHARS.replace_all(text, "").into_owned()
}

fn remove_page_numbers(text: &str) -> String {
    RE_PAGE_NUMBER.replace_all(text, "").into_owned()
}

fn remove_watermark(text: &str, patterns: &str) -> String {
    let mut text = text.to_string();
    for pat in patterns.split(',') {
        let pat = pat.trim();
        if pat.is_empty() {
            continue;
        }
        match Regex::new(pat) {
            Ok(re) => text = re.replace_all(&text, "").into_owned(),
            Err(e) => warn!(pattern = pat, error = %e, "invalid watermark regex, skipped"),
        }
    }
    text
}

fn collapse_blank_lines(text: &str) -> String {
    RE_BLANK_LINES.replace_all(text, "\n\n").into_owned()
}

/// Clean one Markdown document, applying enabled rules in the fixed order:
/// image-placeholder removal → HTML strip → control chars → page numbers →
/// watermark → blank-line collapse → trim.
pub fn clean_markdown(text: &str, cfg: &MdCleanConfig) -> (String, CleanStats) {
    let mut stats = CleanStats {
        original_len: text.chars().count(),
        cleaned_len: text.chars().count(),
        rules_applied: Vec::new(),
    };

    if !cfg.enabled {
        return (text.to_string(), stats);
    }
    if text.is_empty() {
        return (String::new(), stats);
    }

    let original_text = text;
    let mut text = text.to_string();

    if cfg.remove_image_placeholders {
        text = remove_image_placeholders(&text);
        stats.rules_applied.push("remove_image_placeholders".to_string());
    }
    if cfg.strip_html {
        text = strip_html_tags(&text);
        stats.rules_applied.push("strip_html".to_string());
    }
    if cfg.remove_control_chars {
        text = remove_control_chars(&text);
        stats.rules_applied.push("remove_control_chars".to_string());
    }
    if cfg.remove_page_numbers {
        text = remove_page_numbers(&text);
        stats.rules_applied.push("remove_page_numbers".to_string());
    }
    if cfg.remove_watermark && !cfg.watermark_patterns.is_empty() {
        text = remove_watermark(&text, &cfg.watermark_patterns);
        stats.rules_applied.push("remove_watermark".to_string());
    }
    if cfg.collapse_blank_lines {
        text = collapse_blank_lines(&text);
        stats.rules_applied.push("collapse_blank_lines".to_string());
    }

    let mut cleaned = text.trim().to_string();

    if cleaned.chars().count() < MIN_CLEANED_LENGTH && original_text.chars().count() >= MIN_CLEANED_LENGTH {
        warn!(
            cleaned_len = cleaned.chars().count(),
            original_len = original_text.chars().count(),
            "cleaned text too short, reverting to original"
        );
        cleaned = original_text.to_string();
        stats.rules_applied.push("fallback_to_original".to_string());
    }

    stats.cleaned_len = cleaned.chars().count();
    (cleaned, stats)
}

/// Clean a batch of `(task_key, text, file_name)` entries, returning cleaned
/// text per key plus aggregate statistics.
pub fn clean_all(
    entries: &[(String, String, String)],
    cfg: &MdCleanConfig,
) -> (std::collections::HashMap<String, String>, AggregateCleanStats) {
    if !cfg.enabled {
        let total_chars: u64 = entries.iter().map(|(_, text, _)| text.chars().count() as u64).sum();
        let cleaned = entries.iter().map(|(key, text, _)| (key.clone(), text.clone())).collect();
        return (
            cleaned,
            AggregateCleanStats {
                total_original: total_chars,
                total_cleaned: total_chars,
                reduction_pct: 0.0,
                file_count: entries.len(),
            },
        );
    }

    let mut total_original = 0u64;
    let mut total_cleaned = 0u64;
    let mut cleaned_results = std::collections::HashMap::new();

    for (key, text, file_name) in entries {
        let (cleaned_text, file_stats) = clean_markdown(text, cfg);
        total_original += file_stats.original_len as u64;
        total_cleaned += file_stats.cleaned_len as u64;
        let _ = file_name;
        cleaned_results.insert(key.clone(), cleaned_text);
    }

    let reduction_pct = if total_original > 0 {
        (1.0 - total_cleaned as f64 / total_original as f64) * 100.0
    } else {
        0.0
    };

    (
        cleaned_results,
        AggregateCleanStats {
            total_original,
            total_cleaned,
            reduction_pct,
            file_count: entries.len(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> MdCleanConfig {
        MdCleanConfig {
            enabled: true,
            collapse_blank_lines: true,
            strip_html: true,
            remove_control_chars: true,
            remove_image_placeholders: true,
            remove_page_numbers: false,
            remove_watermark: false,
            watermark_patterns: String::new(),
        }
    }

    #[test]
    fn removes_plain_image_placeholder() {
        assert_eq!(remove_image_placeholders("before ![a](b) after"), "before  after");
    }

    #[test]
    fn removes_placeholder_with_escaped_bracket_and_nested_parens() {
        let input = r"before ![a\]x](b(c)) after";
        assert_eq!(remove_image_placeholders(input), "before  after");
    }

    #[test]
    fn never_removes_split_marker() {
        let input = "before <!--split--> after";
        assert_eq!(remove_image_placeholders(input), input);
    }

    #[test]
    fn placeholder_with_newline_inside_is_not_removed() {
        let input = "![a\nb](c)";
        assert_eq!(remove_image_placeholders(input), input);
    }

    #[test]
    fn split_marker_survives_html_stripping() {
        let input = "a<!--split-->b <div>c</div>";
        assert_eq!(strip_html_tags(input), "a<!--split-->b c");
    }

    #[test]
    fn strips_html_inside_fenced_code_blocks_too() {
        let input = "```\n<div>x</div>\n```";
        assert_eq!(strip_html_tags(input), "```\nx\n```");
    }

    #[test]
    fn fallback_to_original_when_too_short() {
        let (cleaned, stats) = clean_markdown("<div></div>", &cfg());
        assert_eq!(cleaned, "<div></div>");
        assert!(stats.rules_applied.contains(&"fallback_to_original".to_string()));
    }

    #[test]
    fn collapses_three_or_more_blank_lines() {
        assert_eq!(collapse_blank_lines("a\n\n\n\nb"), "a\n\nb");
    }

    #[test]
    fn invalid_watermark_pattern_is_skipped_not_fatal() {
        let result = remove_watermark("hello world", "[invalid(");
        assert_eq!(result, "hello world");
    }
}
