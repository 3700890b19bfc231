//! Split-marker rendering for both strategies (§4.5).

use super::elements::{ends_with_terminator, Element, ElementKind};
use crate::models::SPLIT_MARKER;

/// `paragraph_wrap`: collect blocks by scanning lines, rejoin cross-page
/// paragraphs, then wrap each resulting block with split markers.
pub fn render_paragraph_wrap(text: &str) -> String {
    let blocks = collect_paragraph_blocks(text);
    let joined = rejoin_cross_page(blocks);
    joined
        .into_iter()
        .map(|b| format!("{SPLIT_MARKER}\n{b}\n{SPLIT_MARKER}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Debug, Clone)]
struct Block {
    kind: ElementKind,
    text: String,
}

fn collect_paragraph_blocks(text: &str) -> Vec<Block> {
    use super::elements::scan_elements;
    scan_elements(text)
        .into_iter()
        .map(|e| Block { kind: e.kind, text: e.text })
        .collect()
}

const CONTINUATION_STARTERS: &[&str] = &[
    "and", "or", "with", "where", "which", "that", "while", "because", "并", "或", "以及", "其中", "并且", "而且",
];

fn starts_with_continuation(text: &str) -> bool {
    let trimmed = text.trim_start();
    if trimmed.chars().next().map(|c| c.is_lowercase()).unwrap_or(false) {
        return true;
    }
    let lower = trimmed.to_lowercase();
    CONTINUATION_STARTERS.iter().any(|s| lower.starts_with(s))
}

fn starts_with_marker_kind(block: &Block) -> bool {
    matches!(block.kind, ElementKind::List | ElementKind::Blockquote | ElementKind::Table | ElementKind::Heading(_))
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF)
}

fn join_texts(prev: &str, next: &str) -> String {
    let prev_last = prev.chars().last();
    let next_first = next.chars().next();
    let both_cjk = prev_last.map(is_cjk).unwrap_or(false) && next_first.map(is_cjk).unwrap_or(false);
    if both_cjk {
        format!("{prev}{next}")
    } else {
        format!("{prev} {next}")
    }
}

fn rejoin_cross_page(blocks: Vec<Block>) -> Vec<String> {
    let mut out: Vec<Block> = Vec::new();
    for block in blocks {
        if block.kind == ElementKind::Paragraph {
            if let Some(last) = out.last_mut() {
                if last.kind == ElementKind::Paragraph
                    && !ends_with_terminator(&last.text)
                    && !starts_with_marker_kind(&block)
                    && (starts_with_continuation(&block.text))
                {
                    last.text = join_texts(&last.text, &block.text);
                    continue;
                }
            }
        }
        out.push(block);
    }
    out.into_iter().map(|b| b.text).collect()
}

/// `semantic`: insert markers between the given element indices.
pub fn render_semantic(elements: &[Element], split_indices: &[usize]) -> String {
    let mut segments: Vec<String> = Vec::new();
    let mut current = Vec::new();
    let split_set: std::collections::HashSet<usize> = split_indices.iter().copied().collect();

    for (i, el) in elements.iter().enumerate() {
        if split_set.contains(&i) && !current.is_empty() {
            segments.push(current.join("\n"));
            current = Vec::new();
        }
        current.push(el.text.clone());
    }
    if !current.is_empty() {
        segments.push(current.join("\n"));
    }

    segments
        .into_iter()
        .map(|s| format!("{SPLIT_MARKER}\n{s}\n{SPLIT_MARKER}"))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraph_wrap_wraps_each_block_with_markers() {
        let out = render_paragraph_wrap("First block.\n\nSecond block.");
        assert!(out.contains(SPLIT_MARKER));
        assert_eq!(out.matches(SPLIT_MARKER).count(), 4);
    }

    #[test]
    fn cjk_join_has_no_inserted_space() {
        assert_eq!(join_texts("你好", "世界"), "你好世界");
    }

    #[test]
    fn non_cjk_join_inserts_space() {
        assert_eq!(join_texts("hello", "world"), "hello world");
    }
}
