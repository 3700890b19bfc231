//! # Bibliography Ingest
//!
//! A bibliographic-attachment ingestion pipeline: it harvests document
//! attachments from a personal reference manager (over a JSON-RPC bridge),
//! converts them to Markdown via an external OCR/layout-extraction service,
//! post-processes the Markdown (cleaning, figure-summary rewrite, semantic
//! segmentation, size-bounded partitioning), and uploads the result to a
//! retrieval-augmented-generation knowledge base. An HTTP control plane
//! exposes task submission, per-file progress, and runtime configuration.
//!
//! ## Architecture
//!
//! ```text
//! Source bridge → OCR service → Cleaner → Figure summarizer → Splitter → RAG service
//!                                    (pipeline runner, task manager, HTTP control plane)
//! ```
//!
//! ## Modules
//!
//! - [`errors`] — typed error enums per component boundary
//! - [`config`] — process bootstrap config plus the runtime config provider
//! - [`models`] — core data types: `Task`, `FileState`, `Event`, `MarkdownUnit`
//! - [`source_client`] — reference-manager bridge client (C1)
//! - [`ocr_client`] — OCR/layout-extraction client (C2)
//! - [`md_cleaner`] — Markdown sanitization rules (C3)
//! - [`figure_summary`] — figure-summary rewriter (C4)
//! - [`splitter`] — smart splitter and upload-size partitioner (C5)
//! - [`rag_client`] — RAG knowledge-base client (C6)
//! - [`pipeline`] — stage machine orchestrating C1–C6 (C7)
//! - [`task_manager`] — task lifecycle and concurrency bound (C8)
//! - [`progress_store`] — local `progress.json` reconciliation hint
//! - [`server`] — HTTP control plane (C10)
//! - [`progress`] — one-shot CLI progress reporting

pub mod config;
pub mod errors;
pub mod figure_summary;
pub mod md_cleaner;
pub mod models;
pub mod ocr_client;
pub mod pipeline;
pub mod progress;
pub mod progress_store;
pub mod rag_client;
pub mod server;
pub mod source_client;
pub mod splitter;
pub mod task_manager;
