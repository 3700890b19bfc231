//! Mandatory upload-size partitioner (§4.5 "Upload-size partitioner"):
//! runs regardless of split strategy, cutting at heading boundaries near
//! `k·max_chars` targets with a hard byte-offset fallback.

use std::sync::LazyLock;
use regex::Regex;

static RE_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s").unwrap());

#[derive(Debug, Clone, Default)]
pub struct PartitionCounters {
    pub heading_cuts: u64,
    pub hard_cuts: u64,
}

#[derive(Debug, Clone)]
pub struct PartitionedChild {
    pub text: String,
    pub part_index: u32,
}

/// Partition `text` into chunks no longer than `max_chars`, preferring
/// heading-line cut points near each `k·max_chars` target.
pub fn partition(text: &str, max_chars: usize) -> (Vec<PartitionedChild>, PartitionCounters) {
    let mut counters = PartitionCounters::default();
    if max_chars == 0 || text.chars().count() <= max_chars {
        return (
            vec![PartitionedChild {
                text: text.to_string(),
                part_index: 1,
            }],
            counters,
        );
    }

    let heading_offsets: Vec<usize> = RE_HEADING.find_iter(text).map(|m| char_offset(text, m.start())).collect();
    let total_chars = text.chars().count();

    let mut cuts: Vec<usize> = Vec::new();
    let mut prev_cut = 0usize;
    let mut target = max_chars;
    while target < total_chars {
        let chosen = heading_offsets
            .iter()
            .copied()
            .filter(|&o| o > prev_cut)
            .min_by_key(|&o| o.abs_diff(target));

        let cut = match chosen {
            Some(o) => {
                counters.heading_cuts += 1;
                o
            }
            None => {
                let fallback = line_start_after(text, prev_cut, target).unwrap_or(target).max(prev_cut + 1);
                counters.hard_cuts += 1;
                fallback
            }
        };

        if cut <= prev_cut || cut >= total_chars {
            break;
        }
        cuts.push(cut);
        prev_cut = cut;
        target = cut + max_chars;
    }

    let mut children = Vec::new();
    let mut start = 0usize;
    for &cut in &cuts {
        children.push(slice_chars(text, start, cut));
        start = cut;
    }
    children.push(slice_chars(text, start, total_chars));

    // Final hard-slice pass: anything still over max_chars is cut by fixed
    // char offsets (a stand-in for byte offsets given Rust's UTF-8 strings).
    let mut final_children = Vec::new();
    for child in children {
        if child.chars().count() <= max_chars {
            final_children.push(child);
        } else {
            let mut rest = child.as_str();
            while rest.chars().count() > max_chars {
                let cut_at = rest.char_indices().nth(max_chars).map(|(i, _)| i).unwrap_or(rest.len());
                final_children.push(rest[..cut_at].to_string());
                rest = &rest[cut_at..];
                counters.hard_cuts += 1;
            }
            if !rest.is_empty() {
                final_children.push(rest.to_string());
            }
        }
    }

    let children = final_children
        .into_iter()
        .enumerate()
        .map(|(i, text)| PartitionedChild {
            text,
            part_index: (i + 1) as u32,
        })
        .collect();

    (children, counters)
}

fn char_offset(text: &str, byte_offset: usize) -> usize {
    text[..byte_offset].chars().count()
}

fn slice_chars(text: &str, start: usize, end: usize) -> String {
    text.chars().skip(start).take(end - start).collect()
}

/// Last line start strictly after `after` and at or before `target_char_offset`,
/// or `None` if the span contains no further newline to anchor a cut on.
fn line_start_after(text: &str, after: usize, target_char_offset: usize) -> Option<usize> {
    let mut offset = 0usize;
    let mut found = None;
    for line in text.split_inclusive('\n') {
        if offset > target_char_offset {
            break;
        }
        if offset > after {
            found = Some(offset);
        }
        offset += line.chars().count();
    }
    found
}

/// Build the child document name `<stem>.part{k}of{N}.md`.
pub fn partition_child_name(stem: &str, part_index: u32, part_count: u32) -> String {
    format!("{stem}.part{part_index}of{part_count}.md")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_document_unchanged_when_under_limit() {
        let (children, counters) = partition("short text", 1000);
        assert_eq!(children.len(), 1);
        assert_eq!(counters.heading_cuts, 0);
        assert_eq!(counters.hard_cuts, 0);
    }

    #[test]
    fn every_child_is_within_max_chars() {
        let mut text = String::new();
        for i in 0..10 {
            text.push_str(&format!("# H{i}\n"));
            text.push_str(&"x".repeat(40_000));
            text.push('\n');
        }
        let (children, _) = partition(&text, 100_000);
        for child in &children {
            assert!(child.text.chars().count() <= 100_000);
        }
    }

    #[test]
    fn nine_hundred_k_doc_with_one_far_heading_respects_bounds() {
        // Heading sits at 1.5x max_chars in a 3x max_chars document, so no
        // cut sequence can land on it and still produce exactly three
        // max_chars-bounded children; the binding invariant is the per-child
        // bound plus evidence that both cut kinds fired.
        let mut text = String::new();
        text.push_str(&"a".repeat(450_000));
        text.push_str("\n# H\n");
        text.push_str(&"b".repeat(449_995));
        let (children, counters) = partition(&text, 300_000);
        assert!(!children.is_empty());
        assert!(counters.heading_cuts >= 1);
        assert!(counters.hard_cuts >= 1);
        for child in &children {
            assert!(child.text.chars().count() <= 300_000);
        }
    }

    #[test]
    fn hard_cut_fallback_makes_max_chars_sized_progress() {
        // Unbroken prose with no heading and no embedded newline: the
        // fallback must not degenerate into single-character advances.
        let text = "x".repeat(1_000_000);
        let (children, counters) = partition(&text, 300_000);
        assert!(children.len() <= 4);
        assert!(counters.hard_cuts >= 1);
        for child in &children {
            assert!(child.text.chars().count() <= 300_000);
        }
    }

    #[test]
    fn child_name_matches_expected_pattern() {
        assert_eq!(partition_child_name("paper", 2, 3), "paper.part2of3.md");
    }
}
