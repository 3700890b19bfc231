//! Field schema for the six runtime-config categories: type, default,
//! bounds, options, and sensitivity. Mirrors `CONFIG_SCHEMA` plus its
//! `ENV_KEY_MAP`.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Str,
    Bool,
    Int,
    Float,
    Select,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub category: &'static str,
    pub key: &'static str,
    pub field_type: FieldType,
    pub default: Value,
    pub label: &'static str,
    pub sensitive: bool,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub options: &'static [&'static str],
}

macro_rules! field {
    ($cat:literal, $key:literal, $ty:ident, $default:expr, $label:literal, $sensitive:expr) => {
        FieldSpec {
            category: $cat,
            key: $key,
            field_type: FieldType::$ty,
            default: $default,
            label: $label,
            sensitive: $sensitive,
            min: None,
            max: None,
            options: &[],
        }
    };
    ($cat:literal, $key:literal, $ty:ident, $default:expr, $label:literal, $sensitive:expr, min=$min:expr, max=$max:expr) => {
        FieldSpec {
            category: $cat,
            key: $key,
            field_type: FieldType::$ty,
            default: $default,
            label: $label,
            sensitive: $sensitive,
            min: Some($min),
            max: Some($max),
            options: &[],
        }
    };
    ($cat:literal, $key:literal, $ty:ident, $default:expr, $label:literal, $sensitive:expr, options=$options:expr) => {
        FieldSpec {
            category: $cat,
            key: $key,
            field_type: FieldType::$ty,
            default: $default,
            label: $label,
            sensitive: $sensitive,
            min: None,
            max: None,
            options: $options,
        }
    };
}

/// The six configuration categories, in display order.
pub const CATEGORIES: &[&str] = &[
    "zotero",
    "mineru",
    "dify",
    "md_clean",
    "image_summary",
    "smart_split",
];

pub fn category_label(category: &str) -> &'static str {
    match category {
        "zotero" => "Zotero",
        "mineru" => "MinerU",
        "dify" => "Dify",
        "md_clean" => "Markdown Cleaning",
        "image_summary" => "Figure Summarization",
        "smart_split" => "Smart Split",
        _ => "",
    }
}

pub static SCHEMA: LazyLock<Vec<FieldSpec>> = LazyLock::new(|| {
    vec![
        field!("zotero", "mcp_url", Str, json!("http://127.0.0.1:23120/mcp"), "Bridge URL", false),
        field!("zotero", "collection_keys", Str, json!(""), "Collection keys (comma-separated)", false),
        field!("zotero", "collection_recursive", Bool, json!(true), "Recurse into subcollections", false),
        field!("zotero", "collection_page_size", Int, json!(50), "Page size", false, min = 1.0, max = 500.0),
        field!("mineru", "api_token", Str, json!(""), "API token", true),
        field!("mineru", "model_version", Select, json!("vlm"), "Model version", false, options = &["vlm", "doc"]),
        field!("mineru", "poll_timeout_s", Int, json!(7200), "Poll timeout (s)", false, min = 60.0, max = 86400.0),
        field!("mineru", "asset_output_dir", Str, json!("outputs/mineru_assets"), "Image asset output directory", false),
        field!("dify", "api_key", Str, json!(""), "Dataset API key", true),
        field!("dify", "base_url", Str, json!("https://api.dify.ai/v1"), "Base URL", false),
        field!("dify", "dataset_name", Str, json!("Zotero Literature"), "Dataset name", false),
        field!("dify", "pipeline_file", Str, json!(""), "Pipeline override file path", false),
        field!("dify", "process_mode", Select, json!("custom"), "Process mode", false, options = &["custom", "automatic"]),
        field!("dify", "segment_separator", Str, json!("\\n\\n"), "Segment separator", false),
        field!("dify", "segment_max_tokens", Int, json!(800), "Segment max tokens", false, min = 100.0, max = 10000.0),
        field!("dify", "chunk_overlap", Int, json!(0), "Segment overlap", false, min = 0.0, max = 1000.0),
        field!("dify", "parent_mode", Str, json!("paragraph"), "Parent mode", false),
        field!("dify", "subchunk_separator", Str, json!("\\n"), "Subchunk separator", false),
        field!("dify", "subchunk_max_tokens", Int, json!(256), "Subchunk max tokens", false, min = 50.0, max = 5000.0),
        field!("dify", "subchunk_overlap", Int, json!(0), "Subchunk overlap", false, min = 0.0, max = 500.0),
        field!("dify", "remove_extra_spaces", Bool, json!(true), "Remove extra spaces", false),
        field!("dify", "remove_urls_emails", Bool, json!(false), "Remove URLs/emails", false),
        field!("dify", "index_max_wait_s", Int, json!(1800), "Indexing wait cap (s)", false, min = 60.0, max = 7200.0),
        field!("dify", "doc_form", Str, json!(""), "Document form", false),
        field!("dify", "doc_language", Str, json!(""), "Document language", false),
        field!("dify", "upload_delay", Int, json!(1), "Upload delay (s)", false, min = 0.0, max = 30.0),
        field!("md_clean", "enabled", Bool, json!(true), "Enable cleaning", false),
        field!("md_clean", "collapse_blank_lines", Bool, json!(true), "Collapse blank lines", false),
        field!("md_clean", "strip_html", Bool, json!(true), "Strip HTML", false),
        field!("md_clean", "remove_control_chars", Bool, json!(true), "Remove control characters", false),
        field!("md_clean", "remove_image_placeholders", Bool, json!(true), "Remove image placeholders", false),
        field!("md_clean", "remove_page_numbers", Bool, json!(false), "Remove page numbers", false),
        field!("md_clean", "remove_watermark", Bool, json!(false), "Remove watermark", false),
        field!("md_clean", "watermark_patterns", Str, json!(""), "Watermark regexes (comma-separated)", false),
        field!("image_summary", "enabled", Bool, json!(true), "Enable figure summarization", false),
        field!("image_summary", "api_base_url", Str, json!("https://api.openai.com/v1"), "Vision API base URL", false),
        field!("image_summary", "api_key", Str, json!(""), "Vision API key", true),
        field!("image_summary", "model", Str, json!("gpt-4.1-mini"), "Vision model", false),
        field!("image_summary", "request_timeout_s", Int, json!(120), "Request timeout (s)", false, min = 10.0, max = 600.0),
        field!("image_summary", "max_context_chars", Int, json!(3000), "Max context chars per image", false, min = 500.0, max = 20000.0),
        field!("image_summary", "max_images_per_doc", Int, json!(50), "Max images per document", false, min = 0.0, max = 500.0),
        field!("image_summary", "max_tokens", Int, json!(900), "Vision output token cap", false, min = 128.0, max = 4000.0),
        field!("image_summary", "temperature", Float, json!(0.1), "Vision temperature", false, min = 0.0, max = 2.0),
        field!("image_summary", "concurrency", Int, json!(4), "Vision worker pool concurrency", false, min = 1.0, max = 32.0),
        field!("smart_split", "enabled", Bool, json!(true), "Enable smart split", false),
        field!("smart_split", "strategy", Select, json!("paragraph_wrap"), "Split strategy", false, options = &["paragraph_wrap", "semantic"]),
        field!("smart_split", "split_marker", Str, json!(crate::models::SPLIT_MARKER), "Split marker", false),
        field!("smart_split", "max_length", Int, json!(1200), "Max segment length", false, min = 200.0, max = 10000.0),
        field!("smart_split", "min_length", Int, json!(300), "Min segment length", false, min = 50.0, max = 5000.0),
        field!("smart_split", "min_split_score", Float, json!(7.0), "Min split score", false, min = 0.0, max = 50.0),
        field!("smart_split", "heading_score_bonus", Float, json!(10.0), "Heading bonus", false, min = 0.0, max = 50.0),
        field!("smart_split", "sentence_end_score_bonus", Float, json!(6.0), "Sentence-end bonus", false, min = 0.0, max = 50.0),
        field!("smart_split", "sentence_integrity_weight", Float, json!(8.0), "Sentence integrity weight", false, min = 0.0, max = 50.0),
        field!("smart_split", "length_score_factor", Int, json!(100), "Length score factor", false, min = 1.0, max = 1000.0),
        field!("smart_split", "search_window", Int, json!(5), "Search window", false, min = 1.0, max = 20.0),
        field!("smart_split", "heading_after_penalty", Float, json!(12.0), "Post-heading penalty", false, min = 0.0, max = 50.0),
        field!("smart_split", "force_split_before_heading", Bool, json!(true), "Force split before heading", false),
        field!("smart_split", "heading_cooldown_elements", Int, json!(2), "Heading cooldown (elements)", false, min = 0.0, max = 10.0),
        field!("smart_split", "custom_heading_regex", Str, json!(""), "Custom heading regex (comma-separated)", false),
    ]
});

pub static ENV_KEY_MAP: LazyLock<HashMap<&'static str, (&'static str, &'static str)>> = LazyLock::new(|| {
    HashMap::from([
        ("ZOTERO_MCP_URL", ("zotero", "mcp_url")),
        ("ZOTERO_COLLECTION_KEYS", ("zotero", "collection_keys")),
        ("ZOTERO_COLLECTION_RECURSIVE", ("zotero", "collection_recursive")),
        ("ZOTERO_COLLECTION_PAGE_SIZE", ("zotero", "collection_page_size")),
        ("MINERU_API_TOKEN", ("mineru", "api_token")),
        ("POLL_TIMEOUT_MINERU", ("mineru", "poll_timeout_s")),
        ("MINERU_ASSET_OUTPUT_DIR", ("mineru", "asset_output_dir")),
        ("DIFY_API_KEY", ("dify", "api_key")),
        ("DIFY_BASE_URL", ("dify", "base_url")),
        ("DIFY_DATASET_NAME", ("dify", "dataset_name")),
        ("DIFY_PIPELINE_FILE", ("dify", "pipeline_file")),
        ("DIFY_PROCESS_MODE", ("dify", "process_mode")),
        ("DIFY_SEGMENT_SEPARATOR", ("dify", "segment_separator")),
        ("DIFY_SEGMENT_MAX_TOKENS", ("dify", "segment_max_tokens")),
        ("DIFY_CHUNK_OVERLAP", ("dify", "chunk_overlap")),
        ("DIFY_PARENT_MODE", ("dify", "parent_mode")),
        ("DIFY_SUBCHUNK_SEPARATOR", ("dify", "subchunk_separator")),
        ("DIFY_SUBCHUNK_MAX_TOKENS", ("dify", "subchunk_max_tokens")),
        ("DIFY_SUBCHUNK_OVERLAP", ("dify", "subchunk_overlap")),
        ("DIFY_REMOVE_EXTRA_SPACES", ("dify", "remove_extra_spaces")),
        ("DIFY_REMOVE_URLS_EMAILS", ("dify", "remove_urls_emails")),
        ("DIFY_INDEX_MAX_WAIT", ("dify", "index_max_wait_s")),
        ("DIFY_DOC_FORM", ("dify", "doc_form")),
        ("DIFY_DOC_LANGUAGE", ("dify", "doc_language")),
        ("DIFY_UPLOAD_DELAY", ("dify", "upload_delay")),
        ("MD_CLEAN_ENABLED", ("md_clean", "enabled")),
        ("MD_CLEAN_COLLAPSE_BLANK_LINES", ("md_clean", "collapse_blank_lines")),
        ("MD_CLEAN_STRIP_HTML", ("md_clean", "strip_html")),
        ("MD_CLEAN_REMOVE_CONTROL_CHARS", ("md_clean", "remove_control_chars")),
        ("MD_CLEAN_REMOVE_IMAGE_PLACEHOLDERS", ("md_clean", "remove_image_placeholders")),
        ("MD_CLEAN_REMOVE_PAGE_NUMBERS", ("md_clean", "remove_page_numbers")),
        ("MD_CLEAN_REMOVE_WATERMARK", ("md_clean", "remove_watermark")),
        ("MD_CLEAN_WATERMARK_PATTERNS", ("md_clean", "watermark_patterns")),
        ("IMAGE_SUMMARY_ENABLED", ("image_summary", "enabled")),
        ("IMAGE_SUMMARY_API_BASE_URL", ("image_summary", "api_base_url")),
        ("IMAGE_SUMMARY_API_KEY", ("image_summary", "api_key")),
        ("IMAGE_SUMMARY_MODEL", ("image_summary", "model")),
        ("IMAGE_SUMMARY_TIMEOUT_S", ("image_summary", "request_timeout_s")),
        ("IMAGE_SUMMARY_MAX_CONTEXT_CHARS", ("image_summary", "max_context_chars")),
        ("IMAGE_SUMMARY_MAX_IMAGES_PER_DOC", ("image_summary", "max_images_per_doc")),
        ("IMAGE_SUMMARY_MAX_TOKENS", ("image_summary", "max_tokens")),
        ("IMAGE_SUMMARY_TEMPERATURE", ("image_summary", "temperature")),
        ("SMART_SPLIT_STRATEGY", ("smart_split", "strategy")),
    ])
});

pub fn find_field(category: &str, key: &str) -> Option<&'static FieldSpec> {
    SCHEMA.iter().find(|f| f.category == category && f.key == key)
}

/// Build the full default configuration tree from the schema.
pub fn build_defaults() -> Value {
    let mut root = serde_json::Map::new();
    for category in CATEGORIES {
        let mut cat = serde_json::Map::new();
        for field in SCHEMA.iter().filter(|f| &f.category == category) {
            cat.insert(field.key.to_string(), field.default.clone());
        }
        root.insert(category.to_string(), Value::Object(cat));
    }
    Value::Object(root)
}

fn coerce_value(value: &Value, spec: &FieldSpec) -> Value {
    if value.is_null() || matches!(value, Value::String(s) if s.is_empty()) {
        return spec.default.clone();
    }
    match spec.field_type {
        FieldType::Bool => {
            if let Value::Bool(b) = value {
                return json!(*b);
            }
            let s = value_to_string(value).to_lowercase();
            json!(matches!(s.as_str(), "true" | "1" | "yes" | "on"))
        }
        FieldType::Int => match value_to_string(value).trim().parse::<i64>() {
            Ok(mut v) => {
                if let Some(min) = spec.min {
                    v = v.max(min as i64);
                }
                if let Some(max) = spec.max {
                    v = v.min(max as i64);
                }
                json!(v)
            }
            Err(_) => spec.default.clone(),
        },
        FieldType::Float => match value_to_string(value).trim().parse::<f64>() {
            Ok(mut v) => {
                if let Some(min) = spec.min {
                    v = v.max(min);
                }
                if let Some(max) = spec.max {
                    v = v.min(max);
                }
                json!(v)
            }
            Err(_) => spec.default.clone(),
        },
        FieldType::Select => {
            let s = value_to_string(value);
            if spec.options.contains(&s.as_str()) {
                json!(s)
            } else {
                spec.default.clone()
            }
        }
        FieldType::Str => json!(value_to_string(value)),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Validate and coerce an arbitrary JSON tree against the schema, filling
/// any missing category/key with its default (mirrors `validate_and_coerce`).
pub fn validate_and_coerce(data: &Value) -> Value {
    let mut result = build_defaults();
    let Some(result_obj) = result.as_object_mut() else {
        return result;
    };
    let Some(data_obj) = data.as_object() else {
        return Value::Object(result_obj.clone());
    };
    for category in CATEGORIES {
        let Some(cat_data) = data_obj.get(*category).and_then(|v| v.as_object()) else {
            continue;
        };
        let cat_result = result_obj
            .get_mut(*category)
            .and_then(|v| v.as_object_mut())
            .expect("category present in defaults");
        for field in SCHEMA.iter().filter(|f| &f.category == category) {
            if let Some(v) = cat_data.get(field.key) {
                cat_result.insert(field.key.to_string(), coerce_value(v, field));
            }
        }
    }
    Value::Object(result_obj.clone())
}

/// Mask sensitive string fields, keeping a fixed-width prefix of asterisks
/// plus the trailing 4 characters (per the spec's explicit masking example,
/// which overrides the length-preserving scheme of the source this was
/// distilled from — see DESIGN.md).
pub fn mask_sensitive(data: &Value) -> Value {
    let mut masked = serde_json::Map::new();
    let data_obj = data.as_object();
    for category in CATEGORIES {
        let mut cat_masked = serde_json::Map::new();
        let cat_data = data_obj.and_then(|d| d.get(*category)).and_then(|v| v.as_object());
        for field in SCHEMA.iter().filter(|f| &f.category == category) {
            let value = cat_data
                .and_then(|c| c.get(field.key))
                .cloned()
                .unwrap_or_else(|| field.default.clone());
            let masked_value = if field.sensitive {
                if let Value::String(s) = &value {
                    if s.len() > 4 {
                        json!(format!("******{}", &s[s.len() - 4..]))
                    } else {
                        value.clone()
                    }
                } else {
                    value.clone()
                }
            } else {
                value.clone()
            };
            cat_masked.insert(field.key.to_string(), masked_value);
        }
        masked.insert(category.to_string(), Value::Object(cat_masked));
    }
    Value::Object(masked)
}
