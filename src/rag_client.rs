//! RAG knowledge-base upload client (C6): dataset lookup, remote document
//! name index, upload-choice dispatch, process-rule build with optional
//! `.pipeline` YAML override, and indexing poll.
//!
//! Grounded on `original_source/dify_client.py`.

use crate::errors::RagError;
use crate::models::{markdown_doc_name, RemoteNameIndex};
use regex::Regex;
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const TEXT_MODEL_FORM: &str = "text_model";
pub const HIERARCHICAL_FORM: &str = "hierarchical_model";
pub const RAG_PIPELINE_MODE: &str = "rag_pipeline";

const POLL_INTERVAL_DIFY: Duration = Duration::from_secs(10);
const DEFAULT_INDEX_MAX_WAIT_S: u64 = 1800;

static RE_SHARED_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\{\{#rag\.shared\.([A-Za-z0-9_]+)#\}\}$").unwrap());
static RE_DOC_NAME_ITEM_KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[([^\]]+)\]\s").unwrap());

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RagConfig {
    pub base_url: String,
    pub api_key: String,
    pub dataset_name: String,
    #[serde(default)]
    pub doc_form: String,
    #[serde(default)]
    pub doc_language: String,
    #[serde(default = "default_process_mode")]
    pub process_mode: String,
    #[serde(default = "default_true")]
    pub remove_extra_spaces: bool,
    #[serde(default)]
    pub remove_urls_emails: bool,
    #[serde(default = "default_separator")]
    pub segment_separator: String,
    #[serde(default = "default_segment_max_tokens")]
    pub segment_max_tokens: u32,
    #[serde(default)]
    pub chunk_overlap: u32,
    #[serde(default = "default_parent_mode")]
    pub parent_mode: String,
    #[serde(default = "default_child_separator")]
    pub subchunk_separator: String,
    #[serde(default = "default_subchunk_max_tokens")]
    pub subchunk_max_tokens: u32,
    #[serde(default)]
    pub subchunk_overlap: u32,
    #[serde(default = "default_upload_delay")]
    pub upload_delay_s: u64,
    #[serde(default = "default_index_max_wait")]
    pub index_max_wait_s: u64,
    #[serde(default)]
    pub pipeline_file: String,
}

fn default_true() -> bool {
    true
}
fn default_process_mode() -> String {
    "custom".to_string()
}
fn default_separator() -> String {
    "\\n\\n".to_string()
}
fn default_segment_max_tokens() -> u32 {
    800
}
fn default_parent_mode() -> String {
    "paragraph".to_string()
}
fn default_child_separator() -> String {
    "\\n".to_string()
}
fn default_subchunk_max_tokens() -> u32 {
    256
}
fn default_upload_delay() -> u64 {
    1
}
fn default_index_max_wait() -> u64 {
    DEFAULT_INDEX_MAX_WAIT_S
}

#[derive(Debug, Clone, Default)]
pub struct DatasetInfo {
    pub id: String,
    pub name: String,
    pub doc_form: String,
    pub runtime_mode: String,
    pub indexing_technique: String,
}

/// Progress callback phases, mirroring `_emit_upload_progress`'s `phase`
/// field.
#[derive(Debug, Clone)]
pub enum UploadProgress {
    SubmitOk { item_key: String, batch: String },
    SubmitFailed { item_key: String },
    IndexWaitBegin { pending: usize },
    IndexOk { item_key: String, batch: String },
    IndexFailed { item_key: String, batch: String },
}

pub struct RagClient {
    http: reqwest::Client,
    cfg: RagConfig,
}

impl RagClient {
    pub fn new(cfg: RagConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.cfg.api_key)
    }

    /// Find the dataset by configured name. Never creates one.
    pub async fn get_dataset_id(&self) -> Result<String, RagError> {
        let mut page = 1u32;
        loop {
            let resp = self
                .auth(self.http.get(format!("{}/datasets", self.cfg.base_url)))
                .query(&[("page", page.to_string()), ("limit", "100".to_string())])
                .timeout(Duration::from_secs(30))
                .send()
                .await?;
            let body: Value = resp.error_for_status()?.json().await?;
            let data = body.get("data").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            for ds in &data {
                if ds.get("name").and_then(|v| v.as_str()) == Some(self.cfg.dataset_name.as_str()) {
                    let id = ds.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    info!(dataset = %self.cfg.dataset_name, id, "resolved configured dataset");
                    return Ok(id);
                }
            }
            if !body.get("has_more").and_then(|v| v.as_bool()).unwrap_or(false) {
                break;
            }
            page += 1;
        }
        Err(RagError::DatasetNotFound(self.cfg.dataset_name.clone()))
    }

    /// Verify the service is reachable and the configured key is accepted.
    pub async fn check_health(&self) -> bool {
        let resp = self
            .auth(self.http.get(format!("{}/datasets", self.cfg.base_url)))
            .query(&[("page", "1"), ("limit", "1")])
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        matches!(resp, Ok(r) if r.error_for_status().is_ok())
    }

    pub async fn get_dataset_info(&self, dataset_id: &str) -> DatasetInfo {
        match self.fetch_dataset_detail(dataset_id).await {
            Ok(body) => DatasetInfo {
                id: dataset_id.to_string(),
                name: body.get("name").and_then(|v| v.as_str()).unwrap_or_default().trim().to_string(),
                doc_form: body.get("doc_form").and_then(|v| v.as_str()).unwrap_or_default().trim().to_string(),
                runtime_mode: body.get("runtime_mode").and_then(|v| v.as_str()).unwrap_or_default().trim().to_string(),
                indexing_technique: body.get("indexing_technique").and_then(|v| v.as_str()).unwrap_or_default().trim().to_string(),
            },
            Err(e) => {
                warn!(dataset_id, error = %e, "failed to fetch dataset detail");
                DatasetInfo {
                    id: dataset_id.to_string(),
                    ..Default::default()
                }
            }
        }
    }

    async fn fetch_dataset_detail(&self, dataset_id: &str) -> Result<Value, RagError> {
        let resp = self
            .auth(self.http.get(format!("{}/datasets/{dataset_id}", self.cfg.base_url)))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let body: Value = resp.error_for_status()?.json().await?;
        Ok(body.get("data").cloned().unwrap_or(body))
    }

    /// Pull the remote document name index, paginated 100/page.
    pub async fn get_remote_name_index(&self, dataset_id: &str) -> RemoteNameIndex {
        let mut names = HashSet::new();
        let mut prefixed_item_keys = HashSet::new();
        let mut total = None;
        let mut page = 1u32;

        loop {
            let resp = match self
                .auth(self.http.get(format!("{}/datasets/{dataset_id}/documents", self.cfg.base_url)))
                .query(&[("page", page.to_string()), ("limit", "100".to_string())])
                .timeout(Duration::from_secs(30))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(dataset_id, error = %e, "failed to fetch remote name index");
                    break;
                }
            };
            let body: Value = match resp.error_for_status().map_err(RagError::from).and_then(|r| Ok(r)) {
                Ok(r) => match r.json().await {
                    Ok(b) => b,
                    Err(_) => break,
                },
                Err(_) => break,
            };

            if total.is_none() {
                total = body.get("total").and_then(|v| v.as_u64());
            }
            let docs = body.get("data").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            for doc in &docs {
                let name = doc.get("name").and_then(|v| v.as_str()).unwrap_or_default().trim().to_string();
                if name.is_empty() {
                    continue;
                }
                if let Some(caps) = RE_DOC_NAME_ITEM_KEY.captures(&name) {
                    prefixed_item_keys.insert(caps[1].to_string());
                }
                names.insert(name);
            }
            if !body.get("has_more").and_then(|v| v.as_bool()).unwrap_or(false) {
                break;
            }
            page += 1;
        }

        RemoteNameIndex {
            total,
            names,
            prefixed_item_keys,
        }
    }

    fn build_process_rule(&self, resolved_doc_form: &str) -> Value {
        let mode = self.cfg.process_mode.trim().to_lowercase();
        if mode == "automatic" {
            return json!({"mode": "automatic"});
        }

        let overrides = load_pipeline_rule_overrides(&self.cfg);
        let remove_extra_spaces = overrides.remove_extra_spaces.unwrap_or(self.cfg.remove_extra_spaces);
        let remove_urls_emails = overrides.remove_urls_emails.unwrap_or(self.cfg.remove_urls_emails);
        let segmentation_separator = overrides.segmentation_separator.clone().unwrap_or_else(|| self.cfg.segment_separator.clone());
        let segmentation_max_tokens = overrides.segmentation_max_tokens.unwrap_or(self.cfg.segment_max_tokens);
        let parent_mode = overrides.parent_mode.clone().unwrap_or_else(|| self.cfg.parent_mode.clone());
        let subchunk_separator = overrides.subchunk_separator.clone().unwrap_or_else(|| self.cfg.subchunk_separator.clone());
        let subchunk_max_tokens = overrides.subchunk_max_tokens.unwrap_or(self.cfg.subchunk_max_tokens);

        let mut rules = json!({
            "pre_processing_rules": [
                {"id": "remove_extra_spaces", "enabled": remove_extra_spaces},
                {"id": "remove_urls_emails", "enabled": remove_urls_emails},
            ],
            "segmentation": {
                "separator": segmentation_separator,
                "max_tokens": segmentation_max_tokens,
                "chunk_overlap": self.cfg.chunk_overlap,
            },
        });

        if resolved_doc_form == HIERARCHICAL_FORM {
            rules["parent_mode"] = json!(parent_mode);
            rules["subchunk_segmentation"] = json!({
                "separator": subchunk_separator,
                "max_tokens": subchunk_max_tokens,
                "chunk_overlap": self.cfg.subchunk_overlap,
            });
        }

        json!({"mode": "custom", "rules": rules})
    }

    async fn upload_by_text(&self, dataset_id: &str, doc_name: &str, text: &str, resolved_doc_form: &str) -> Result<String, RagError> {
        let mut body = json!({
            "name": doc_name,
            "text": text,
            "indexing_technique": "high_quality",
            "process_rule": self.build_process_rule(resolved_doc_form),
        });
        if !resolved_doc_form.is_empty() {
            body["doc_form"] = json!(resolved_doc_form);
        }
        if !self.cfg.doc_language.is_empty() {
            body["doc_language"] = json!(self.cfg.doc_language);
        }

        let resp = self
            .auth(self.http.post(format!("{}/datasets/{dataset_id}/document/create-by-text", self.cfg.base_url)))
            .json(&body)
            .timeout(Duration::from_secs(60))
            .send()
            .await?;
        let body: Value = resp.error_for_status()?.json().await?;
        Ok(body.get("batch").and_then(|v| v.as_str()).unwrap_or_default().to_string())
    }

    async fn upload_markdown_as_file(&self, dataset_id: &str, doc_name: &str, text: &str, resolved_doc_form: &str) -> Result<String, RagError> {
        let mut payload = json!({
            "indexing_technique": "high_quality",
            "process_rule": self.build_process_rule(resolved_doc_form),
        });
        if !resolved_doc_form.is_empty() {
            payload["doc_form"] = json!(resolved_doc_form);
        }
        if !self.cfg.doc_language.is_empty() {
            payload["doc_language"] = json!(self.cfg.doc_language);
        }

        let file_part = multipart::Part::bytes(text.as_bytes().to_vec())
            .file_name(doc_name.to_string())
            .mime_str("text/markdown")
            .map_err(|e| RagError::UploadFailed(e.to_string()))?;
        let form = multipart::Form::new()
            .part("file", file_part)
            .text("data", payload.to_string());

        let resp = self
            .auth(self.http.post(format!("{}/datasets/{dataset_id}/document/create-by-file", self.cfg.base_url)))
            .multipart(form)
            .timeout(Duration::from_secs(120))
            .send()
            .await?;
        let body: Value = resp.error_for_status()?.json().await?;
        Ok(body.get("batch").and_then(|v| v.as_str()).unwrap_or_default().to_string())
    }

    /// Upload one Markdown document, dispatching by effective doc_form /
    /// runtime mode, returning the batch id.
    pub async fn upload_document(&self, dataset_id: &str, item_key: &str, file_name: &str, text: &str, doc_form: &str, runtime_mode: &str) -> Option<String> {
        if text.trim().is_empty() {
            error!(item_key, file_name, "markdown empty, skipping upload");
            return None;
        }

        let doc_name = markdown_doc_name(item_key, file_name);
        let resolved_doc_form = if !doc_form.trim().is_empty() {
            doc_form.trim().to_string()
        } else if !self.cfg.doc_form.trim().is_empty() {
            self.cfg.doc_form.trim().to_string()
        } else {
            TEXT_MODEL_FORM.to_string()
        };

        let use_text_upload = resolved_doc_form == TEXT_MODEL_FORM && runtime_mode.trim() != RAG_PIPELINE_MODE;
        let result = if use_text_upload {
            self.upload_by_text(dataset_id, &doc_name, text, &resolved_doc_form).await
        } else {
            if runtime_mode.trim() == RAG_PIPELINE_MODE {
                info!(doc_name, "dataset runtime_mode=rag_pipeline, uploading as markdown file");
            } else {
                warn!(doc_name, doc_form = resolved_doc_form, "uploading via create-by-file for non-text-model doc_form");
            }
            self.upload_markdown_as_file(dataset_id, &doc_name, text, &resolved_doc_form).await
        };

        match result {
            Ok(batch) => {
                info!(doc_name, batch, "uploaded to RAG dataset");
                Some(batch)
            }
            Err(e) => {
                error!(doc_name, error = %e, "RAG upload failed");
                None
            }
        }
    }

    /// Poll indexing status until every doc is `completed` with full
    /// segment counts, `error`, or the timeout elapses (one final re-check
    /// on timeout before declaring failure).
    pub async fn wait_for_indexing(&self, dataset_id: &str, batch: &str, max_wait: Option<Duration>) -> bool {
        if batch.is_empty() {
            return false;
        }
        let max_wait = max_wait.unwrap_or_else(|| Duration::from_secs(self.cfg.index_max_wait_s));
        let start = Instant::now();

        while start.elapsed() < max_wait {
            match self.fetch_indexing_docs(dataset_id, batch).await {
                Ok(docs) if docs.is_empty() => {
                    tokio::time::sleep(POLL_INTERVAL_DIFY).await;
                    continue;
                }
                Ok(docs) => {
                    if docs.iter().any(|d| d.get("indexing_status").and_then(|v| v.as_str()) == Some("error")) {
                        error!(batch, "RAG indexing failed");
                        return false;
                    }
                    if docs.iter().all(|d| d.get("indexing_status").and_then(|v| v.as_str()) == Some("completed")) {
                        return validate_completed_docs(&docs);
                    }
                }
                Err(e) => warn!(batch, error = %e, "failed to query indexing status"),
            }
            tokio::time::sleep(POLL_INTERVAL_DIFY).await;
        }

        warn!(batch, timeout_s = max_wait.as_secs(), "RAG indexing poll timed out, performing final re-check");
        if let Ok(docs) = self.fetch_indexing_docs(dataset_id, batch).await {
            if !docs.is_empty() && docs.iter().all(|d| d.get("indexing_status").and_then(|v| v.as_str()) == Some("completed")) {
                return validate_completed_docs(&docs);
            }
        }
        false
    }

    async fn fetch_indexing_docs(&self, dataset_id: &str, batch: &str) -> Result<Vec<Value>, RagError> {
        let resp = self
            .auth(self.http.get(format!("{}/datasets/{dataset_id}/documents/{batch}/indexing-status", self.cfg.base_url)))
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let body: Value = resp.error_for_status()?.json().await?;
        Ok(body.get("data").and_then(|v| v.as_array()).cloned().unwrap_or_default())
    }

    /// Upload every `(item_key, file_name, text)` entry, then wait for
    /// indexing of every submitted batch, reporting progress via
    /// `on_progress`.
    pub async fn upload_all(
        &self,
        dataset_id: &str,
        entries: &[(String, String, String)],
        dataset_info: &DatasetInfo,
        mut on_progress: impl FnMut(UploadProgress),
    ) -> (Vec<String>, Vec<String>) {
        let mut uploaded = Vec::new();
        let mut failed = Vec::new();
        let mut pending_batches: HashMap<String, String> = HashMap::new();

        let effective_doc_form = if !dataset_info.doc_form.is_empty() {
            dataset_info.doc_form.clone()
        } else if !self.cfg.doc_form.trim().is_empty() {
            self.cfg.doc_form.trim().to_string()
        } else {
            TEXT_MODEL_FORM.to_string()
        };
        if !dataset_info.doc_form.is_empty() && !self.cfg.doc_form.trim().is_empty() && dataset_info.doc_form != self.cfg.doc_form.trim() {
            warn!(configured = %self.cfg.doc_form, dataset = %dataset_info.doc_form, "doc_form mismatch, using dataset value");
        }

        for (item_key, file_name, text) in entries {
            let batch = self
                .upload_document(dataset_id, item_key, file_name, text, &effective_doc_form, &dataset_info.runtime_mode)
                .await;
            match batch {
                Some(batch) => {
                    on_progress(UploadProgress::SubmitOk {
                        item_key: item_key.clone(),
                        batch: batch.clone(),
                    });
                    pending_batches.insert(item_key.clone(), batch);
                }
                None => {
                    failed.push(item_key.clone());
                    on_progress(UploadProgress::SubmitFailed { item_key: item_key.clone() });
                }
            }
            tokio::time::sleep(Duration::from_secs(self.cfg.upload_delay_s)).await;
        }

        info!(accepted = pending_batches.len(), rejected = failed.len(), "RAG submit complete");
        on_progress(UploadProgress::IndexWaitBegin { pending: pending_batches.len() });

        for (item_key, batch) in pending_batches {
            if self.wait_for_indexing(dataset_id, &batch, None).await {
                uploaded.push(item_key.clone());
                on_progress(UploadProgress::IndexOk { item_key, batch });
            } else {
                failed.push(item_key.clone());
                on_progress(UploadProgress::IndexFailed { item_key, batch });
            }
        }

        (uploaded, failed)
    }
}

fn validate_completed_docs(docs: &[Value]) -> bool {
    for doc in docs {
        let err_text = doc
            .get("error")
            .and_then(|v| if v.is_null() { None } else { Some(v) })
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .unwrap_or_default();
        if !err_text.trim().is_empty() {
            return false;
        }
        let total_segments = doc.get("total_segments").and_then(|v| v.as_i64()).unwrap_or(0);
        let completed_segments = doc.get("completed_segments").and_then(|v| v.as_i64()).unwrap_or(0);
        if total_segments <= 0 || completed_segments < total_segments {
            return false;
        }
    }
    true
}

#[derive(Debug, Clone, Default)]
struct PipelineOverrides {
    parent_mode: Option<String>,
    segmentation_separator: Option<String>,
    segmentation_max_tokens: Option<u32>,
    subchunk_separator: Option<String>,
    subchunk_max_tokens: Option<u32>,
    remove_extra_spaces: Option<bool>,
    remove_urls_emails: Option<bool>,
}

fn load_pipeline_rule_overrides(cfg: &RagConfig) -> PipelineOverrides {
    let Some(path) = discover_pipeline_file(&cfg.pipeline_file, &cfg.dataset_name) else {
        return PipelineOverrides::default();
    };
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read pipeline file");
            return PipelineOverrides::default();
        }
    };
    let parsed: Value = match serde_yaml::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse pipeline file as YAML");
            return PipelineOverrides::default();
        }
    };
    let overrides = extract_pipeline_rule_overrides(&parsed);
    if overrides.parent_mode.is_none()
        && overrides.segmentation_separator.is_none()
        && overrides.segmentation_max_tokens.is_none()
        && overrides.subchunk_separator.is_none()
        && overrides.subchunk_max_tokens.is_none()
        && overrides.remove_extra_spaces.is_none()
        && overrides.remove_urls_emails.is_none()
    {
        warn!(path = %path.display(), "pipeline file found but no parentchild_chunker parameters resolved");
    } else {
        info!(path = %path.display(), "loaded chunking overrides from pipeline file");
    }
    overrides
}

fn discover_pipeline_file(configured: &str, dataset_name: &str) -> Option<PathBuf> {
    let configured = configured.trim();
    if !configured.is_empty() {
        let p = PathBuf::from(configured);
        if p.is_file() {
            return Some(p);
        }
        warn!(path = configured, "configured pipeline file not found");
    }

    let base = dataset_name.trim();
    if base.is_empty() {
        return None;
    }

    let search_dirs: Vec<PathBuf> = [std::env::current_dir().ok(), Some(PathBuf::from(".")), dirs_downloads()]
        .into_iter()
        .flatten()
        .collect();

    let mut candidates = Vec::new();
    for suffix in ["", " (1)", " (2)"] {
        let filename = format!("{base}{suffix}.pipeline");
        for dir in &search_dirs {
            candidates.push(dir.join(&filename));
        }
    }

    let mut seen = HashSet::new();
    let mut existing: Vec<PathBuf> = candidates
        .into_iter()
        .filter(|p| seen.insert(p.clone()) && p.is_file())
        .collect();

    existing.sort_by_key(|p| std::fs::metadata(p).and_then(|m| m.modified()).ok());
    existing.pop()
}

fn dirs_downloads() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| Path::new(&h).join("Downloads"))
}

fn resolve_param_value(entry: Option<&Value>, shared_defaults: &HashMap<String, Value>) -> Option<Value> {
    let entry = entry?.as_object()?;
    let value = entry.get("value")?;
    if let Some(s) = value.as_str() {
        if let Some(caps) = RE_SHARED_REF.captures(s.trim()) {
            return shared_defaults.get(&caps[1]).cloned();
        }
    }
    Some(value.clone())
}

fn extract_pipeline_rule_overrides(pipeline: &Value) -> PipelineOverrides {
    let workflow = pipeline.get("workflow").cloned().unwrap_or(Value::Null);
    let graph = workflow.get("graph").cloned().unwrap_or(Value::Null);
    let nodes = graph.get("nodes").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let rag_vars = workflow.get("rag_pipeline_variables").and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let mut shared_defaults = HashMap::new();
    for item in &rag_vars {
        let Some(name) = item.get("variable").and_then(|v| v.as_str()) else {
            continue;
        };
        if name.trim().is_empty() {
            continue;
        }
        shared_defaults.insert(name.trim().to_string(), item.get("default_value").cloned().unwrap_or(Value::Null));
    }

    let mut params = Value::Null;
    for node in &nodes {
        let data = node.get("data");
        if data.and_then(|d| d.get("tool_name")).and_then(|v| v.as_str()) == Some("parentchild_chunker") {
            params = data.unwrap().get("tool_parameters").cloned().unwrap_or(Value::Null);
            break;
        }
    }

    let mut out = PipelineOverrides::default();
    if params.is_object() {
        out.parent_mode = resolve_param_value(params.get("parent_mode"), &shared_defaults).and_then(value_to_string);
        out.segmentation_separator = resolve_param_value(params.get("separator"), &shared_defaults).and_then(value_to_string);
        out.segmentation_max_tokens = resolve_param_value(params.get("max_length"), &shared_defaults).and_then(value_to_u32);
        out.subchunk_separator = resolve_param_value(params.get("subchunk_separator"), &shared_defaults).and_then(value_to_string);
        out.subchunk_max_tokens = resolve_param_value(params.get("subchunk_max_length"), &shared_defaults).and_then(value_to_u32);
        out.remove_extra_spaces = resolve_param_value(params.get("remove_extra_spaces"), &shared_defaults).and_then(value_to_bool);
        out.remove_urls_emails = resolve_param_value(params.get("remove_urls_emails"), &shared_defaults).and_then(value_to_bool);
    }

    // Fallback map: anything not resolved from tool_parameters falls back to
    // the shared defaults under their differently-spelled keys.
    if out.parent_mode.is_none() {
        out.parent_mode = shared_defaults.get("parent_mode").cloned().and_then(value_to_string);
    }
    if out.segmentation_separator.is_none() {
        out.segmentation_separator = shared_defaults.get("parent_dilmiter").cloned().and_then(value_to_string);
    }
    if out.segmentation_max_tokens.is_none() {
        out.segmentation_max_tokens = shared_defaults.get("parent_length").cloned().and_then(value_to_u32);
    }
    if out.subchunk_separator.is_none() {
        out.subchunk_separator = shared_defaults.get("child_delimiter").cloned().and_then(value_to_string);
    }
    if out.subchunk_max_tokens.is_none() {
        out.subchunk_max_tokens = shared_defaults.get("child_length").cloned().and_then(value_to_u32);
    }
    if out.remove_extra_spaces.is_none() {
        out.remove_extra_spaces = shared_defaults.get("clean_1").cloned().and_then(value_to_bool);
    }
    if out.remove_urls_emails.is_none() {
        out.remove_urls_emails = shared_defaults.get("clean_2").cloned().and_then(value_to_bool);
    }

    out
}

fn value_to_string(v: Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn value_to_u32(v: Value) -> Option<u32> {
    match v {
        Value::Number(n) => n.as_u64().map(|n| n as u32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_bool(v: Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_completed_docs_requires_full_segment_count() {
        let docs = vec![json!({"id": "1", "total_segments": 10, "completed_segments": 10})];
        assert!(validate_completed_docs(&docs));
    }

    #[test]
    fn validate_completed_docs_rejects_partial_segments() {
        let docs = vec![json!({"id": "1", "total_segments": 10, "completed_segments": 5})];
        assert!(!validate_completed_docs(&docs));
    }

    #[test]
    fn validate_completed_docs_rejects_error_field() {
        let docs = vec![json!({"id": "1", "total_segments": 10, "completed_segments": 10, "error": "boom"})];
        assert!(!validate_completed_docs(&docs));
    }

    #[test]
    fn extract_overrides_resolves_shared_ref() {
        let pipeline = json!({
            "workflow": {
                "rag_pipeline_variables": [{"variable": "parent_length", "default_value": 1024}],
                "graph": {"nodes": [{"data": {
                    "tool_name": "parentchild_chunker",
                    "tool_parameters": {"max_length": {"value": "{{#rag.shared.parent_length#}}"}}
                }}]}
            }
        });
        let overrides = extract_pipeline_rule_overrides(&pipeline);
        assert_eq!(overrides.segmentation_max_tokens, Some(1024));
    }

    #[test]
    fn extract_overrides_empty_without_parentchild_node() {
        let pipeline = json!({"workflow": {"graph": {"nodes": []}}});
        let overrides = extract_pipeline_rule_overrides(&pipeline);
        assert!(overrides.parent_mode.is_none());
    }
}
