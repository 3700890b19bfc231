//! Smart splitter (C5): marker insertion (`paragraph_wrap` or `semantic`)
//! followed by the mandatory upload-size partitioner.

pub mod elements;
pub mod heading;
pub mod partition;
pub mod renderer;
pub mod scorer;
mod sentence;

use crate::models::{partition_task_key, MarkdownUnit, PartitionMeta, UploadSplitStats};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmartSplitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default)]
    pub custom_heading_patterns: Vec<String>,
    #[serde(default)]
    pub scorer: scorer::ScorerConfig,
}

fn default_true() -> bool {
    true
}
fn default_strategy() -> String {
    "paragraph_wrap".to_string()
}
fn default_max_chars() -> usize {
    300_000
}
fn default_min_length() -> usize {
    200
}
fn default_max_length() -> usize {
    1200
}

impl Default for SmartSplitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            strategy: default_strategy(),
            max_chars: default_max_chars(),
            min_length: default_min_length(),
            max_length: default_max_length(),
            custom_heading_patterns: Vec::new(),
            scorer: scorer::ScorerConfig::default(),
        }
    }
}

/// Insert split markers into `text` per the configured strategy. When
/// `cfg.enabled` is false, marker insertion is skipped entirely (the
/// upload-size partitioner still runs afterward unconditionally).
pub fn insert_markers(text: &str, cfg: &SmartSplitConfig) -> String {
    if !cfg.enabled {
        return text.to_string();
    }
    let normalized = heading::normalize_headings(text);
    match cfg.strategy.as_str() {
        "semantic" => {
            let custom: Vec<Regex> = cfg
                .custom_heading_patterns
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect();
            let mut scan_elements = elements::scan_elements(&normalized);
            for el in scan_elements.iter_mut() {
                if matches!(el.kind, elements::ElementKind::Paragraph) && heading::promote_if_heading_like(&el.text, &custom) {
                    el.kind = elements::ElementKind::Heading(2);
                }
            }
            let scorer_cfg = scorer::ScorerConfig {
                min_length: cfg.min_length,
                max_length: cfg.max_length,
                ..cfg.scorer.clone()
            };
            let splits = scorer::select_split_points(&scan_elements, &scorer_cfg);
            renderer::render_semantic(&scan_elements, &splits)
        }
        _ => renderer::render_paragraph_wrap(&normalized),
    }
}

/// Split one document: insert markers, then mandatory-partition into
/// upload-size units, producing sibling [`MarkdownUnit`]s plus the
/// statistics for this single source file.
pub fn split_document(unit: &MarkdownUnit, cfg: &SmartSplitConfig) -> (Vec<MarkdownUnit>, UploadSplitStats) {
    let marked = insert_markers(&unit.text, cfg);
    let (children, counters) = partition::partition(&marked, cfg.max_chars);

    let mut stats = UploadSplitStats {
        source_files: 1,
        output_docs: children.len() as u64,
        split_source_files: if children.len() > 1 { 1 } else { 0 },
        heading_cuts: counters.heading_cuts,
        hard_cuts: counters.hard_cuts,
    };
    stats.output_docs = children.len() as u64;

    if children.len() == 1 {
        return (vec![unit.clone()], stats);
    }

    let stem = std::path::Path::new(&unit.file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document")
        .to_string();
    let part_count = children.len() as u32;

    let units = children
        .into_iter()
        .map(|child| {
            let part_index = child.part_index;
            MarkdownUnit {
                task_key: partition_task_key(&unit.task_key, part_index),
                text: child.text,
                file_name: partition::partition_child_name(&stem, part_index, part_count),
                source_file_name: unit.source_file_name.clone(),
                assets: unit.assets.clone(),
                partition: Some(PartitionMeta {
                    parent_task_key: unit.task_key.clone(),
                    part_index,
                    part_count,
                }),
            }
        })
        .collect();

    (units, stats)
}

/// Split a batch of documents, returning the flattened sibling units and
/// aggregated statistics across the batch.
pub fn split_all(units: &[MarkdownUnit], cfg: &SmartSplitConfig) -> (Vec<MarkdownUnit>, UploadSplitStats) {
    let mut all_units = Vec::new();
    let mut total = UploadSplitStats::default();
    for unit in units {
        let (children, stats) = split_document(unit, cfg);
        total.source_files += stats.source_files;
        total.output_docs += stats.output_docs;
        total.split_source_files += stats.split_source_files;
        total.heading_cuts += stats.heading_cuts;
        total.hard_cuts += stats.hard_cuts;
        all_units.extend(children);
    }
    (all_units, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(text: &str) -> MarkdownUnit {
        MarkdownUnit {
            task_key: "ABC123#0".to_string(),
            text: text.to_string(),
            file_name: "paper.md".to_string(),
            source_file_name: "paper.pdf".to_string(),
            assets: Vec::new(),
            partition: None,
        }
    }

    #[test]
    fn small_document_is_not_partitioned() {
        let u = unit("# Title\nshort content");
        let cfg = SmartSplitConfig::default();
        let (units, stats) = split_document(&u, &cfg);
        assert_eq!(units.len(), 1);
        assert_eq!(stats.split_source_files, 0);
    }

    #[test]
    fn large_document_produces_named_part_children() {
        let mut text = String::new();
        for i in 0..10 {
            text.push_str(&format!("# H{i}\n"));
            text.push_str(&"x".repeat(40_000));
        }
        let u = unit(&text);
        let mut cfg = SmartSplitConfig::default();
        cfg.max_chars = 100_000;
        let (units, stats) = split_document(&u, &cfg);
        assert!(units.len() > 1);
        assert!(stats.split_source_files >= 1);
        assert!(units[0].file_name.contains("part1of"));
        for unit in &units {
            assert!(unit.partition.is_some());
        }
    }
}
