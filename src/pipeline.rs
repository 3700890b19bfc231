//! Pipeline runner (C7): the sequential stage machine orchestrating
//! C1 (source) → C2 (OCR) → C3 (clean, which invokes C4 per document) →
//! C5 (split) → C6 (RAG upload), with cancellation, skip-file handling,
//! remote reconciliation, and the terminal-status aggregation rule.
//!
//! Grounded on `original_source/services/pipeline_runner.py`'s stage order
//! and reconciliation/aggregation semantics.

use crate::figure_summary::{FigureSummaryRewriter, ImageSummaryConfig};
use crate::md_cleaner::{self, MdCleanConfig};
use crate::models::{
    item_key_of, EventLevel, FileState, FileStatus, ImageAiStats, MarkdownUnit, Stage, Task,
    TaskStatus, UploadSplitStats,
};
use crate::ocr_client::OcrClient;
use crate::rag_client::{DatasetInfo, RagClient, RagConfig, UploadProgress};
use crate::source_client::SourceClient;
use crate::splitter::{self, scorer::ScorerConfig, SmartSplitConfig};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared handle the task manager hands to a spawned pipeline run: the task
/// itself plus the set of filenames marked skipped after the run started.
pub struct TaskHandle {
    pub task: Mutex<Task>,
    pub skip_set: Mutex<HashSet<String>>,
}

impl TaskHandle {
    pub fn new(task: Task) -> Self {
        Self {
            task: Mutex::new(task),
            skip_set: Mutex::new(HashSet::new()),
        }
    }

    fn add_event(&self, level: EventLevel, stage: Stage, tag: &str, message: impl Into<String>) {
        let mut task = self.task.lock().expect("task lock poisoned");
        task.add_event(level, &stage.to_string(), tag, message);
    }

    fn set_stage(&self, stage: Stage) {
        let mut task = self.task.lock().expect("task lock poisoned");
        task.stage = stage;
    }

    fn is_skipped(&self, filename: &str) -> bool {
        self.skip_set.lock().expect("skip set lock poisoned").contains(filename)
    }

    /// Mark `task_key` skipped (C8's `skip_file`). If the file is already
    /// tracked and not yet terminal, its status flips to `skipped`
    /// immediately; otherwise the key is recorded so a later
    /// [`TaskHandle::ensure_file`] call initializes it as skipped directly.
    /// Returns `false` if the file is already terminal (succeeded/failed).
    pub fn mark_skipped(&self, task_key: &str) -> bool {
        self.skip_set.lock().expect("skip set lock poisoned").insert(task_key.to_string());
        let mut task = self.task.lock().expect("task lock poisoned");
        match task.file_mut(task_key) {
            Some(file) if file.status.is_terminal() => false,
            Some(file) => {
                file.status = FileStatus::Skipped;
                true
            }
            None => true,
        }
    }

    fn set_file_status(&self, filename: &str, status: FileStatus, stage: Stage, error: &str) {
        let mut task = self.task.lock().expect("task lock poisoned");
        if let Some(file) = task.file_mut(filename) {
            file.status = status;
            file.stage = stage;
            file.error = error.to_string();
        }
    }

    fn ensure_file(&self, filename: &str) {
        let skipped = self.is_skipped(filename);
        let mut task = self.task.lock().expect("task lock poisoned");
        if task.file_mut(filename).is_none() {
            let mut file = FileState::new(filename);
            if skipped {
                file.status = FileStatus::Skipped;
            }
            task.files.push(file);
        }
    }

    fn set_file_stage(&self, filename: &str, stage: Stage) {
        let mut task = self.task.lock().expect("task lock poisoned");
        if let Some(file) = task.file_mut(filename) {
            file.stage = stage;
        }
    }
}

/// Run the full pipeline for `handle`'s task, driving it from `queued`
/// through its terminal status. Cancellation is checked at every stage
/// boundary; `cancel` is the cooperative token the task manager holds.
pub async fn run(handle: Arc<TaskHandle>, cancel: CancellationToken, data_dir: PathBuf) {
    let snapshot = handle.task.lock().expect("task lock poisoned").config_snapshot.clone();
    {
        let mut task = handle.task.lock().expect("task lock poisoned");
        task.status = TaskStatus::Running;
        task.started_at = Some(chrono::Utc::now());
    }

    let outcome = run_stages(&handle, &cancel, &snapshot, &data_dir).await;
    finalize(&handle, &cancel, outcome);
}

enum StageOutcome {
    Ok,
    NoFiles,
    Cancelled,
    Fatal(String),
}

async fn run_stages(handle: &Arc<TaskHandle>, cancel: &CancellationToken, snapshot: &Value, data_dir: &std::path::Path) -> StageOutcome {
    macro_rules! check_cancel {
        () => {
            if cancel.is_cancelled() {
                return StageOutcome::Cancelled;
            }
        };
    }

    // --- source_collect -------------------------------------------------
    handle.set_stage(Stage::SourceCollect);
    check_cancel!();

    let zotero = snapshot.get("zotero").cloned().unwrap_or_default();
    let mcp_url = jstr(&zotero, "mcp_url", "http://127.0.0.1:23120/mcp");
    let collection_recursive = jbool(&zotero, "collection_recursive", true);
    let page_size = jint(&zotero, "collection_page_size", 50) as u32;
    let collection_keys = handle.task.lock().expect("task lock poisoned").collection_keys.clone();

    let source = SourceClient::new(mcp_url);
    let dify_cfg = build_rag_config(&snapshot.get("dify").cloned().unwrap_or_default());
    let dataset_name = dify_cfg.dataset_name.clone();
    let rag = RagClient::new(dify_cfg);

    let dataset_id = match rag.get_dataset_id().await {
        Ok(id) => id,
        Err(e) => return StageOutcome::Fatal(format!("RAG dataset lookup failed: {e}")),
    };
    let dataset_info = rag.get_dataset_info(&dataset_id).await;
    let remote_index = rag.get_remote_name_index(&dataset_id).await;

    let progress_store = crate::progress_store::ProgressStore::new(data_dir.join("progress.json"));
    let mut progress_data = progress_store.load();
    crate::progress_store::reconcile(&mut progress_data, &remote_index);
    let _ = progress_store.save(&progress_data);
    let mut uploaded_item_keys = remote_index.prefixed_item_keys.clone();
    uploaded_item_keys.extend(progress_data.processed.keys().map(|k| crate::models::item_key_of(k).to_string()));

    let file_map = source
        .collect_files(&uploaded_item_keys, &collection_keys, collection_recursive, page_size)
        .await;

    if file_map.is_empty() {
        handle.add_event(EventLevel::Info, Stage::SourceCollect, "no_files", "no attachments to process after remote reconciliation");
        return StageOutcome::NoFiles;
    }

    for (_, task_key) in &file_map {
        handle.ensure_file(task_key);
    }
    handle.add_event(
        EventLevel::Info,
        Stage::SourceCollect,
        "collected",
        format!("{} attachment(s) collected", file_map.len()),
    );

    let file_map: Vec<(String, String)> = file_map.into_iter().filter(|(_, key)| !handle.is_skipped(key)).collect();
    check_cancel!();

    // --- ocr_upload / ocr_poll ------------------------------------------
    handle.set_stage(Stage::OcrUpload);
    let mineru = snapshot.get("mineru").cloned().unwrap_or_default();
    let asset_output_dir = resolve_asset_output_dir(data_dir, &jstr(&mineru, "asset_output_dir", "outputs/mineru_assets"));
    let ocr = OcrClient::new(
        "https://mineru.net/api/v4".to_string(),
        jstr(&mineru, "api_token", ""),
        jstr(&mineru, "model_version", "vlm"),
        Duration::from_secs(jint(&mineru, "poll_timeout_s", 7200)),
        asset_output_dir,
    );

    handle.set_stage(Stage::OcrPoll);
    let (ocr_successes, ocr_failures) = ocr.process_files(&file_map, cancel).await;
    for (task_key, err) in &ocr_failures {
        handle.set_file_status(task_key, FileStatus::Failed, Stage::OcrPoll, err);
        handle.add_event(EventLevel::Error, Stage::OcrPoll, "ocr_failed", format!("{task_key}: {err}"));
    }
    check_cancel!();

    // --- clean (C3, invoking C4 per document) + smart_split (C5) --------
    handle.set_stage(Stage::Clean);
    let md_clean_cfg: MdCleanConfig = serde_json::from_value(snapshot.get("md_clean").cloned().unwrap_or_default()).unwrap_or_else(|_| default_md_clean());
    let image_summary_cfg: ImageSummaryConfig =
        serde_json::from_value(snapshot.get("image_summary").cloned().unwrap_or_default()).unwrap_or_else(|_| default_image_summary());
    let rewriter = FigureSummaryRewriter::new(image_summary_cfg);
    let smart_split_cfg = build_smart_split_config(&snapshot.get("smart_split").cloned().unwrap_or_default());

    let mut units: Vec<MarkdownUnit> = Vec::new();
    let mut image_ai_stats = ImageAiStats::default();
    let mut split_stats = UploadSplitStats::default();

    for (task_key, result) in ocr_successes {
        if handle.is_skipped(&task_key) {
            continue;
        }
        handle.set_file_status(&task_key, FileStatus::Processing, Stage::Clean, "");

        let (rewritten, fig_stats) = rewriter.rewrite(&result.text, &result.assets).await;
        image_ai_stats.total_images += fig_stats.total_images;
        image_ai_stats.ai_attempted += fig_stats.ai_attempted;
        image_ai_stats.ai_succeeded += fig_stats.ai_succeeded;
        image_ai_stats.ai_failed += fig_stats.ai_failed;
        image_ai_stats.fallback_used += fig_stats.fallback_used;

        let (cleaned, _clean_stats) = md_cleaner::clean_markdown(&rewritten, &md_clean_cfg);

        let unit = MarkdownUnit {
            task_key: task_key.clone(),
            text: cleaned,
            file_name: result.file_name.clone(),
            source_file_name: result.file_name,
            assets: result.assets,
            partition: None,
        };

        handle.set_file_stage(&task_key, Stage::SmartSplit);
        let (children, doc_stats) = splitter::split_document(&unit, &smart_split_cfg);
        split_stats.source_files += doc_stats.source_files;
        split_stats.output_docs += doc_stats.output_docs;
        split_stats.split_source_files += doc_stats.split_source_files;
        split_stats.heading_cuts += doc_stats.heading_cuts;
        split_stats.hard_cuts += doc_stats.hard_cuts;
        units.extend(children);
    }
    image_ai_stats.enabled = true;
    {
        let mut task = handle.task.lock().expect("task lock poisoned");
        task.runtime_stats.image_ai = Some(image_ai_stats);
        task.runtime_stats.upload_doc_split = Some(split_stats);
    }
    check_cancel!();

    // --- upload (C6) ------------------------------------------------------
    handle.set_stage(Stage::Upload);
    let units: Vec<MarkdownUnit> = units.into_iter().filter(|u| !handle.is_skipped(u.parent_task_key())).collect();
    let entries: Vec<(String, String, String)> = units
        .iter()
        .map(|u| (item_key_of(&u.task_key).to_string(), u.file_name.clone(), u.text.clone()))
        .collect();

    let file_name_by_parent: HashMap<String, String> =
        units.iter().map(|u| (u.parent_task_key().to_string(), u.source_file_name.clone())).collect();

    // parent_task_key -> expected child count, for post-upload aggregation.
    let mut expected_children: HashMap<String, u32> = HashMap::new();
    for unit in &units {
        *expected_children.entry(unit.parent_task_key().to_string()).or_insert(0) += 1;
    }
    let mut index_ok_counts: HashMap<String, u32> = HashMap::new();
    let mut parent_failed: HashSet<String> = HashSet::new();
    let task_key_by_item_key: HashMap<String, String> =
        units.iter().map(|u| (item_key_of(&u.task_key).to_string(), u.parent_task_key().to_string())).collect();

    handle.set_stage(Stage::Index);
    let mut on_progress = |progress: UploadProgress| {
        handle_progress(handle, progress, &task_key_by_item_key, &mut index_ok_counts, &mut parent_failed);
    };
    let (_, _) = rag.upload_all(&dataset_id, &entries, &dataset_info, &mut on_progress).await;

    // --- finalize: post-upload N-child aggregation -----------------------
    handle.set_stage(Stage::Finalize);
    for (parent_key, expected) in &expected_children {
        let achieved = index_ok_counts.get(parent_key).copied().unwrap_or(0);
        let failed = parent_failed.contains(parent_key) || achieved < *expected;
        if handle.is_skipped(parent_key) {
            continue;
        }
        let file_name = file_name_by_parent.get(parent_key).map(String::as_str).unwrap_or(parent_key);
        if failed {
            handle.set_file_status(parent_key, FileStatus::Failed, Stage::Finalize, "upload/index did not complete for all parts");
            crate::progress_store::ProgressStore::record_outcome(
                &mut progress_data,
                parent_key,
                false,
                file_name,
                &dataset_name,
                "upload",
                "upload/index did not complete for all parts",
            );
        } else {
            handle.set_file_status(parent_key, FileStatus::Succeeded, Stage::Finalize, "");
            crate::progress_store::ProgressStore::record_outcome(
                &mut progress_data,
                parent_key,
                true,
                file_name,
                &dataset_name,
                "",
                "",
            );
        }
    }
    let _ = progress_store.save(&progress_data);

    StageOutcome::Ok
}

fn handle_progress(
    handle: &Arc<TaskHandle>,
    progress: UploadProgress,
    task_key_by_item_key: &HashMap<String, String>,
    index_ok_counts: &mut HashMap<String, u32>,
    parent_failed: &mut HashSet<String>,
) {
    match progress {
        UploadProgress::SubmitOk { item_key, batch } => {
            handle.add_event(EventLevel::Info, Stage::Upload, "submit_ok", format!("{item_key} batch={batch}"));
        }
        UploadProgress::SubmitFailed { item_key } => {
            if let Some(parent) = task_key_by_item_key.get(&item_key) {
                parent_failed.insert(parent.clone());
            }
            handle.add_event(EventLevel::Error, Stage::Upload, "submit_failed", item_key);
        }
        UploadProgress::IndexWaitBegin { pending } => {
            handle.add_event(EventLevel::Info, Stage::Index, "index_wait_begin", format!("{pending} pending"));
        }
        UploadProgress::IndexOk { item_key, batch } => {
            if let Some(parent) = task_key_by_item_key.get(&item_key) {
                *index_ok_counts.entry(parent.clone()).or_insert(0) += 1;
            }
            handle.add_event(EventLevel::Info, Stage::Index, "index_ok", format!("{item_key} batch={batch}"));
        }
        UploadProgress::IndexFailed { item_key, batch } => {
            if let Some(parent) = task_key_by_item_key.get(&item_key) {
                parent_failed.insert(parent.clone());
            }
            handle.add_event(EventLevel::Error, Stage::Index, "index_failed", format!("{item_key} batch={batch}"));
        }
    }
}

/// Apply the terminal-status rule (§4.7) and the cancellation override,
/// then stamp the finish timestamp.
fn finalize(handle: &Arc<TaskHandle>, cancel: &CancellationToken, outcome: StageOutcome) {
    let mut task = handle.task.lock().expect("task lock poisoned");

    if cancel.is_cancelled() {
        task.status = TaskStatus::Cancelled;
        task.finished_at = Some(chrono::Utc::now());
        let seq = task.events.last().map(|e| e.seq + 1).unwrap_or(1);
        task.events.push(crate::models::Event {
            seq,
            timestamp: chrono::Utc::now(),
            level: EventLevel::Warn,
            stage: task.stage.to_string(),
            tag: "cancelled".to_string(),
            message: "task cancelled".to_string(),
        });
        return;
    }

    match outcome {
        StageOutcome::Fatal(msg) => {
            task.status = TaskStatus::Failed;
            task.error = msg;
        }
        StageOutcome::NoFiles => {
            task.status = TaskStatus::Succeeded;
        }
        StageOutcome::Cancelled => {
            task.status = TaskStatus::Cancelled;
        }
        StageOutcome::Ok => {
            let relevant: Vec<&FileState> = task.files.iter().filter(|f| f.status != FileStatus::Skipped).collect();
            let any_failed = relevant.iter().any(|f| f.status == FileStatus::Failed);
            let any_succeeded = relevant.iter().any(|f| f.status == FileStatus::Succeeded);
            task.status = if !any_failed && (any_succeeded || relevant.is_empty()) {
                TaskStatus::Succeeded
            } else if any_succeeded {
                TaskStatus::PartialSucceeded
            } else {
                TaskStatus::Failed
            };
        }
    }
    task.finished_at = Some(chrono::Utc::now());
}

// --- config-snapshot extraction helpers --------------------------------

fn jstr(v: &Value, key: &str, default: &str) -> String {
    v.get(key).and_then(|v| v.as_str()).unwrap_or(default).to_string()
}

fn jbool(v: &Value, key: &str, default: bool) -> bool {
    v.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn jint(v: &Value, key: &str, default: u64) -> u64 {
    v.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

fn jfloat(v: &Value, key: &str, default: f64) -> f64 {
    v.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

/// Resolve `mineru.asset_output_dir` against the bootstrap data directory
/// when it's relative, so the two config layers agree on one location.
fn resolve_asset_output_dir(data_dir: &Path, configured: &str) -> PathBuf {
    let configured = PathBuf::from(configured);
    if configured.is_absolute() {
        configured
    } else {
        data_dir.join(configured)
    }
}

fn build_rag_config(dify: &Value) -> RagConfig {
    RagConfig {
        base_url: jstr(dify, "base_url", "https://api.dify.ai/v1"),
        api_key: jstr(dify, "api_key", ""),
        dataset_name: jstr(dify, "dataset_name", "Zotero Literature"),
        doc_form: jstr(dify, "doc_form", ""),
        doc_language: jstr(dify, "doc_language", ""),
        process_mode: jstr(dify, "process_mode", "custom"),
        remove_extra_spaces: jbool(dify, "remove_extra_spaces", true),
        remove_urls_emails: jbool(dify, "remove_urls_emails", false),
        segment_separator: jstr(dify, "segment_separator", "\\n\\n"),
        segment_max_tokens: jint(dify, "segment_max_tokens", 800) as u32,
        chunk_overlap: jint(dify, "chunk_overlap", 0) as u32,
        parent_mode: jstr(dify, "parent_mode", "paragraph"),
        subchunk_separator: jstr(dify, "subchunk_separator", "\\n"),
        subchunk_max_tokens: jint(dify, "subchunk_max_tokens", 256) as u32,
        subchunk_overlap: jint(dify, "subchunk_overlap", 0) as u32,
        // Schema key `upload_delay` maps to this struct's `upload_delay_s`.
        upload_delay_s: jint(dify, "upload_delay", 1),
        index_max_wait_s: jint(dify, "index_max_wait_s", 1800),
        pipeline_file: jstr(dify, "pipeline_file", ""),
    }
}

fn build_smart_split_config(ss: &Value) -> SmartSplitConfig {
    let min_length = jint(ss, "min_length", 300) as usize;
    let max_length = jint(ss, "max_length", 1200) as usize;
    let scorer = ScorerConfig {
        min_length,
        max_length,
        min_split_score: jfloat(ss, "min_split_score", 7.0),
        heading_bonus: jfloat(ss, "heading_score_bonus", 10.0),
        sentence_end_bonus: jfloat(ss, "sentence_end_score_bonus", 6.0),
        sentence_integrity_weight: jfloat(ss, "sentence_integrity_weight", 8.0),
        heading_after_penalty: jfloat(ss, "heading_after_penalty", 12.0),
        length_score_factor: jfloat(ss, "length_score_factor", 100.0),
        heading_cooldown_elements: jint(ss, "heading_cooldown_elements", 2) as usize,
        search_window: jint(ss, "search_window", 5) as usize,
        force_split_before_heading: jbool(ss, "force_split_before_heading", true),
    };
    let custom_heading_patterns = jstr(ss, "custom_heading_regex", "")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    SmartSplitConfig {
        enabled: jbool(ss, "enabled", true),
        strategy: jstr(ss, "strategy", "paragraph_wrap"),
        max_chars: SmartSplitConfig::default().max_chars,
        min_length,
        max_length,
        custom_heading_patterns,
        scorer,
    }
}

fn default_md_clean() -> MdCleanConfig {
    serde_json::from_value(serde_json::json!({})).expect("all MdCleanConfig fields have defaults")
}

fn default_image_summary() -> ImageSummaryConfig {
    ImageSummaryConfig {
        enabled: false,
        api_base_url: String::new(),
        api_key: String::new(),
        model: String::new(),
        request_timeout_s: 120,
        max_context_chars: 3000,
        max_images_per_doc: 50,
        max_tokens: 900,
        temperature: 0.1,
        concurrency: 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Event;

    #[test]
    fn terminal_status_succeeds_when_all_files_succeed() {
        let mut task = Task::new(vec![], serde_json::json!({}), 1);
        task.files.push(FileState {
            filename: "a".into(),
            status: FileStatus::Succeeded,
            stage: Stage::Finalize,
            error: String::new(),
        });
        let handle = Arc::new(TaskHandle::new(task));
        let cancel = CancellationToken::new();
        finalize(&handle, &cancel, StageOutcome::Ok);
        assert_eq!(handle.task.lock().unwrap().status, TaskStatus::Succeeded);
    }

    #[test]
    fn terminal_status_partial_when_mixed() {
        let mut task = Task::new(vec![], serde_json::json!({}), 1);
        task.files.push(FileState {
            filename: "a".into(),
            status: FileStatus::Succeeded,
            stage: Stage::Finalize,
            error: String::new(),
        });
        task.files.push(FileState {
            filename: "b".into(),
            status: FileStatus::Failed,
            stage: Stage::OcrPoll,
            error: "bad pdf".into(),
        });
        let handle = Arc::new(TaskHandle::new(task));
        let cancel = CancellationToken::new();
        finalize(&handle, &cancel, StageOutcome::Ok);
        assert_eq!(handle.task.lock().unwrap().status, TaskStatus::PartialSucceeded);
    }

    #[test]
    fn terminal_status_failed_when_nothing_succeeds() {
        let mut task = Task::new(vec![], serde_json::json!({}), 1);
        task.files.push(FileState {
            filename: "a".into(),
            status: FileStatus::Failed,
            stage: Stage::OcrPoll,
            error: "boom".into(),
        });
        let handle = Arc::new(TaskHandle::new(task));
        let cancel = CancellationToken::new();
        finalize(&handle, &cancel, StageOutcome::Ok);
        assert_eq!(handle.task.lock().unwrap().status, TaskStatus::Failed);
    }

    #[test]
    fn skipped_files_never_count_toward_failure() {
        let mut task = Task::new(vec![], serde_json::json!({}), 1);
        task.files.push(FileState {
            filename: "a".into(),
            status: FileStatus::Skipped,
            stage: Stage::Init,
            error: String::new(),
        });
        task.files.push(FileState {
            filename: "b".into(),
            status: FileStatus::Succeeded,
            stage: Stage::Finalize,
            error: String::new(),
        });
        let handle = Arc::new(TaskHandle::new(task));
        let cancel = CancellationToken::new();
        finalize(&handle, &cancel, StageOutcome::Ok);
        assert_eq!(handle.task.lock().unwrap().status, TaskStatus::Succeeded);
    }

    #[test]
    fn no_files_outcome_is_succeeded() {
        let task = Task::new(vec![], serde_json::json!({}), 1);
        let handle = Arc::new(TaskHandle::new(task));
        let cancel = CancellationToken::new();
        finalize(&handle, &cancel, StageOutcome::NoFiles);
        assert_eq!(handle.task.lock().unwrap().status, TaskStatus::Succeeded);
    }

    #[test]
    fn cancellation_overrides_any_outcome() {
        let task = Task::new(vec![], serde_json::json!({}), 1);
        let handle = Arc::new(TaskHandle::new(task));
        let cancel = CancellationToken::new();
        cancel.cancel();
        finalize(&handle, &cancel, StageOutcome::Fatal("whatever".into()));
        assert_eq!(handle.task.lock().unwrap().status, TaskStatus::Cancelled);
        let events = &handle.task.lock().unwrap().events;
        assert!(events.iter().any(|e: &Event| e.tag == "cancelled" && e.level == EventLevel::Warn));
    }
}
