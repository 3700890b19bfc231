//! Typed error enums for each component boundary.
//!
//! Internal code propagates these via `?`; only the outermost boundaries
//! (CLI `main`, HTTP handlers) collapse them into `anyhow::Error` or an
//! HTTP error envelope.

use thiserror::Error;

/// Errors from the reference-manager bridge client (C1).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("bridge unreachable: {0}")]
    Unreachable(String),
    #[error("bridge returned an error response: {0}")]
    Rpc(String),
    #[error("unexpected response shape: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors from the OCR client (C2).
#[derive(Debug, Error)]
pub enum OcrError {
    #[error("file too large: {name} ({size} bytes > {limit})")]
    FileTooLarge {
        name: String,
        size: u64,
        limit: u64,
    },
    #[error("batch request failed: {0}")]
    BatchRequest(String),
    #[error("upload failed for {name} after {attempts} attempts: {reason}")]
    UploadFailed {
        name: String,
        attempts: u32,
        reason: String,
    },
    #[error("batch {batch_id} did not finish within {timeout_secs}s")]
    PollTimeout { batch_id: String, timeout_secs: u64 },
    #[error("no .md file found in zip for {0}")]
    NoMarkdownInZip(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the RAG client (C6).
#[derive(Debug, Error)]
pub enum RagError {
    #[error("dataset not found for configured name {0:?}")]
    DatasetNotFound(String),
    #[error("upload failed: {0}")]
    UploadFailed(String),
    #[error("indexing failed for batch {0}")]
    IndexingFailed(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Errors from the runtime config provider (C9).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required credential: {0}")]
    MissingCredential(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed config file: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Errors from the pipeline runner (C7).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error(transparent)]
    Rag(#[from] RagError),
    #[error("task cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}
