//! Markdown element line-scanner shared by both split strategies.

use std::sync::LazyLock;
use regex::Regex;

static RE_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.*)$").unwrap());
static RE_LIST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*([-*+]|\d+[.)])\s+").unwrap());
static RE_BLOCKQUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*>").unwrap());
static RE_TABLE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\|.*\|\s*$").unwrap());
static RE_CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(```|~~~)").unwrap());
static RE_PAGE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*\d{1,4}\s*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Heading(u8),
    Paragraph,
    List,
    Blockquote,
    Table,
    Code,
    Blank,
}

#[derive(Debug, Clone)]
pub struct Element {
    pub kind: ElementKind,
    pub text: String,
}

impl Element {
    pub fn is_heading(&self) -> bool {
        matches!(self.kind, ElementKind::Heading(_))
    }

    pub fn ends_with_sentence_terminator(&self) -> bool {
        ends_with_terminator(&self.text)
    }
}

pub fn ends_with_terminator(text: &str) -> bool {
    text.trim_end().chars().last().map(is_terminator_char).unwrap_or(false)
}

pub fn is_terminator_char(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '。' | '！' | '？' | ':' | '：' | ';' | '；')
}

pub fn line_kind(line: &str) -> ElementKind {
    if line.trim().is_empty() {
        ElementKind::Blank
    } else if let Some(caps) = RE_HEADING.captures(line) {
        ElementKind::Heading(caps[1].len() as u8)
    } else if RE_LIST.is_match(line) {
        ElementKind::List
    } else if RE_BLOCKQUOTE.is_match(line) {
        ElementKind::Blockquote
    } else if RE_TABLE.is_match(line) {
        ElementKind::Table
    } else {
        ElementKind::Paragraph
    }
}

/// Scan `text` into a flat sequence of elements, grouping fenced code blocks
/// intact and dropping page-number-only lines and form feeds.
pub fn scan_elements(text: &str) -> Vec<Element> {
    let mut elements = Vec::new();
    let lines: Vec<&str> = text.lines().collect();
    let mut i = 0usize;
    let mut current_kind: Option<ElementKind> = None;
    let mut current_lines: Vec<&str> = Vec::new();

    macro_rules! flush {
        () => {
            if let Some(kind) = current_kind.take() {
                if !current_lines.is_empty() {
                    elements.push(Element {
                        kind,
                        text: current_lines.join("\n"),
                    });
                }
                current_lines.clear();
            }
        };
    }

    while i < lines.len() {
        let raw = lines[i].replace('\x0c', "");
        let line = raw.as_str();

        if RE_PAGE_NUMBER.is_match(line) {
            i += 1;
            continue;
        }

        if RE_CODE_FENCE.is_match(line) {
            flush!();
            let mut block = vec![line.to_string()];
            i += 1;
            while i < lines.len() {
                block.push(lines[i].to_string());
                let fence_closed = RE_CODE_FENCE.is_match(lines[i]);
                i += 1;
                if fence_closed {
                    break;
                }
            }
            elements.push(Element {
                kind: ElementKind::Code,
                text: block.join("\n"),
            });
            continue;
        }

        let kind = line_kind(line);
        if kind == ElementKind::Blank {
            flush!();
            i += 1;
            continue;
        }
        if matches!(kind, ElementKind::Heading(_)) {
            flush!();
            elements.push(Element {
                kind: kind.clone(),
                text: line.to_string(),
            });
            i += 1;
            continue;
        }

        let same_kind = current_kind.as_ref().map(|k| *k == kind).unwrap_or(false);
        if !same_kind {
            flush!();
            current_kind = Some(kind);
        }
        current_lines.push(line);
        i += 1;
    }
    flush!();
    elements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_fenced_code_blocks_intact() {
        let text = "```\nfn main() {}\n```\n\npara text";
        let elements = scan_elements(text);
        assert_eq!(elements[0].kind, ElementKind::Code);
        assert!(elements[0].text.contains("fn main"));
    }

    #[test]
    fn drops_page_number_only_lines() {
        let text = "para one\n\n42\n\npara two";
        let elements = scan_elements(text);
        assert!(elements.iter().all(|e| e.text != "42"));
    }

    #[test]
    fn heading_is_its_own_element() {
        let elements = scan_elements("# Title\npara");
        assert_eq!(elements[0].kind, ElementKind::Heading(1));
    }
}
