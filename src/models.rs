//! Core data types shared by the pipeline, task manager, and HTTP surface.
//!
//! Mirrors the task/stage/event lifecycle model, generalized from a
//! collection-scoped pipeline to the staged ingestion run this crate
//! implements.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported attachment extensions (C1 §4.1).
pub const SUPPORTED_EXTENSIONS: &[&str] =
    &["pdf", "doc", "docx", "ppt", "pptx", "png", "jpg", "jpeg"];

/// Image extensions recognized inside an OCR result archive (C2 §4.2).
pub const IMAGE_ASSET_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "webp", "bmp", "gif", "tif", "tiff"];

/// The literal marker token used both for figure-summary blocks and as the
/// RAG segment separator.
pub const SPLIT_MARKER: &str = "<!--split-->";

/// Lifecycle status of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    PartialSucceeded,
}

impl TaskStatus {
    /// Terminal statuses never transition further.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::PartialSucceeded => "partial_succeeded",
        };
        f.write_str(s)
    }
}

/// Stage of the pipeline runner's sequential stage machine (C7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    SourceCollect,
    OcrUpload,
    OcrPoll,
    Clean,
    SmartSplit,
    Upload,
    Index,
    Finalize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Init => "init",
            Stage::SourceCollect => "source_collect",
            Stage::OcrUpload => "ocr_upload",
            Stage::OcrPoll => "ocr_poll",
            Stage::Clean => "clean",
            Stage::SmartSplit => "smart_split",
            Stage::Upload => "upload",
            Stage::Index => "index",
            Stage::Finalize => "finalize",
        };
        f.write_str(s)
    }
}

/// Per-file status within a task (C7/C8 §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    Skipped,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileStatus::Succeeded | FileStatus::Failed | FileStatus::Skipped
        )
    }
}

/// Per-file record tracked for the lifetime of a [`Task`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub filename: String,
    pub status: FileStatus,
    pub stage: Stage,
    pub error: String,
}

impl FileState {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            status: FileStatus::Pending,
            stage: Stage::Init,
            error: String::new(),
        }
    }
}

/// Append-only log entry (C7 §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub level: EventLevel,
    pub stage: String,
    pub tag: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Aggregated runtime statistics attached to a task, surfaced verbatim over
/// `GET /tasks/{id}` for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeStats {
    pub image_ai: Option<ImageAiStats>,
    pub upload_doc_split: Option<UploadSplitStats>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageAiStats {
    pub enabled: bool,
    pub total_images: u64,
    pub ai_attempted: u64,
    pub ai_succeeded: u64,
    pub ai_failed: u64,
    pub fallback_used: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadSplitStats {
    pub source_files: u64,
    pub output_docs: u64,
    pub split_source_files: u64,
    pub heading_cuts: u64,
    pub hard_cuts: u64,
}

/// A single ingestion run (C3 data model §3, C7, C8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub status: TaskStatus,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub collection_keys: Vec<String>,
    pub config_version: u64,
    #[serde(skip)]
    pub config_snapshot: serde_json::Value,
    pub files: Vec<FileState>,
    pub events: Vec<Event>,
    pub runtime_stats: RuntimeStats,
    pub error: String,
}

impl Task {
    pub fn new(
        collection_keys: Vec<String>,
        config_snapshot: serde_json::Value,
        config_version: u64,
    ) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            status: TaskStatus::Queued,
            stage: Stage::Init,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            collection_keys,
            config_version,
            config_snapshot,
            files: Vec::new(),
            events: Vec::new(),
            runtime_stats: RuntimeStats::default(),
            error: String::new(),
        }
    }

    /// Append an event, assigning the next sequence number. Sequence numbers
    /// start at 1 and are strictly increasing and gap-free (property 3).
    pub fn add_event(&mut self, level: EventLevel, stage: &str, tag: &str, message: impl Into<String>) {
        let seq = self.events.last().map(|e| e.seq + 1).unwrap_or(1);
        self.events.push(Event {
            seq,
            timestamp: Utc::now(),
            level,
            stage: stage.to_string(),
            tag: tag.to_string(),
            message: message.into(),
        });
    }

    pub fn file_mut(&mut self, filename: &str) -> Option<&mut FileState> {
        self.files.iter_mut().find(|f| f.filename == filename)
    }

    /// Compact summary view used by `GET /tasks` (list form).
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            task_id: self.task_id.clone(),
            status: self.status,
            stage: self.stage,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            collection_keys: self.collection_keys.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: String,
    pub status: TaskStatus,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub collection_keys: Vec<String>,
}

/// An image asset extracted from an OCR result archive (C2 §4.2, used by
/// C4's asset index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAsset {
    /// Absolute path on local disk.
    pub disk_path: String,
    /// Basename, e.g. `fig1.png`.
    pub name: String,
    /// Path as referenced by the Markdown (relative to the `.md`'s directory).
    pub link_path: String,
    /// Path inside the source zip archive.
    pub archive_path: String,
}

/// Metadata describing a document produced by the upload-size partitioner
/// (C5 §4.5), if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub parent_task_key: String,
    pub part_index: u32,
    pub part_count: u32,
}

/// The in-memory Markdown unit flowing through C3 → C4 → C5 → C6 (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkdownUnit {
    pub task_key: String,
    pub text: String,
    pub file_name: String,
    pub source_file_name: String,
    pub assets: Vec<ImageAsset>,
    pub partition: Option<PartitionMeta>,
}

impl MarkdownUnit {
    /// The task key of the pre-partition document: itself if not a
    /// partitioner child, else the parent's key (§3, attachment identity).
    pub fn parent_task_key(&self) -> &str {
        match &self.partition {
            Some(p) => &p.parent_task_key,
            None => &self.task_key,
        }
    }
}

/// Build a `task_key` for the `index`-th supported attachment of `item_key`
/// (§3, attachment identity).
pub fn attachment_task_key(item_key: &str, index: usize) -> String {
    format!("{item_key}#{index}")
}

/// Build a child task key produced by the upload-size partitioner (§3).
pub fn partition_task_key(parent_task_key: &str, part: u32) -> String {
    format!("{parent_task_key}#part{part}")
}

/// Extract the `item_key` portion of a `task_key` (text before the first `#`).
pub fn item_key_of(task_key: &str) -> &str {
    task_key.split('#').next().unwrap_or(task_key)
}

/// A snapshot of the RAG dataset's document-name index (§3, remote name
/// index).
#[derive(Debug, Clone, Default)]
pub struct RemoteNameIndex {
    pub total: Option<u64>,
    pub names: std::collections::HashSet<String>,
    pub prefixed_item_keys: std::collections::HashSet<String>,
}

/// The canonical document name for an attachment (§3).
pub fn markdown_doc_name(item_key: &str, file_name: &str) -> String {
    let stem = std::path::Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document");
    format!("[{item_key}] {stem}.md")
}
