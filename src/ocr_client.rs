//! OCR/layout-extraction service client (C2): pre-signed batch upload with
//! retry, polling, and zip-to-markdown extraction.

use crate::errors::OcrError;
use crate::models::{ImageAsset, IMAGE_ASSET_EXTENSIONS};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MAX_FILE_SIZE_BYTES: u64 = 200 * 1024 * 1024;
const BATCH_SIZE: usize = 200;
const POLL_INTERVAL: Duration = Duration::from_secs(30);
const UPLOAD_BACKOFF_SECS: [u64; 3] = [2, 8, 32];
const UPLOAD_MAX_RETRIES: u32 = 3;

pub struct OcrResult {
    pub text: String,
    pub file_name: String,
    pub assets: Vec<ImageAsset>,
}

pub struct OcrClient {
    http: reqwest::Client,
    base_url: String,
    api_token: String,
    model_version: String,
    poll_timeout: Duration,
    asset_output_dir: PathBuf,
}

impl OcrClient {
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        model_version: impl Into<String>,
        poll_timeout: Duration,
        asset_output_dir: PathBuf,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_token: api_token.into(),
            model_version: model_version.into(),
            poll_timeout,
            asset_output_dir,
        }
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_token)
    }

    /// Verify the service is reachable and the configured token is accepted.
    pub async fn check_health(&self) -> bool {
        let resp = self
            .http
            .get(format!("{}/file-urls/batch", self.base_url))
            .header("Authorization", self.auth_header())
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match resp {
            Ok(r) => r.status().as_u16() != 401 && r.status().as_u16() != 403,
            Err(_) => false,
        }
    }

    fn validate_file_size(path: &str) -> Result<(), OcrError> {
        let size = std::fs::metadata(path)?.len();
        if size > MAX_FILE_SIZE_BYTES {
            return Err(OcrError::FileTooLarge {
                name: basename(path),
                size,
                limit: MAX_FILE_SIZE_BYTES,
            });
        }
        Ok(())
    }

    async fn request_upload_urls(&self, entries: &[Value]) -> Result<(String, Vec<String>), OcrError> {
        let resp = self
            .http
            .post(format!("{}/file-urls/batch", self.base_url))
            .header("Authorization", self.auth_header())
            .json(&json!({"files": entries, "model_version": self.model_version}))
            .timeout(Duration::from_secs(60))
            .send()
            .await?;
        let body: Value = resp.error_for_status()?.json().await?;
        if body.get("code").and_then(|v| v.as_i64()) != Some(0) {
            return Err(OcrError::BatchRequest(body.to_string()));
        }
        let data = &body["data"];
        let batch_id = data["batch_id"].as_str().unwrap_or_default().to_string();
        let urls = data["file_urls"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        Ok((batch_id, urls))
    }

    /// PUT a local file to a pre-signed URL, retrying on connection errors,
    /// timeouts, HTTP 429, and 5xx; failing immediately on other 4xx.
    async fn upload_file(&self, url: &str, path: &str) -> Result<(), OcrError> {
        let mut last_err = String::new();
        for attempt in 1..=UPLOAD_MAX_RETRIES {
            let bytes = tokio::fs::read(path).await?;
            let result = self
                .http
                .put(url)
                .body(bytes)
                .timeout(Duration::from_secs(600))
                .send()
                .await;
            match result {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => return Ok(()),
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS || resp.status().is_server_error() => {
                    last_err = format!("HTTP {} (retryable)", resp.status());
                }
                Ok(resp) => {
                    return Err(OcrError::UploadFailed {
                        name: basename(path),
                        attempts: attempt,
                        reason: format!("HTTP {}", resp.status()),
                    });
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    last_err = e.to_string();
                }
                Err(e) => return Err(OcrError::Transport(e)),
            }
            if attempt < UPLOAD_MAX_RETRIES {
                let wait = UPLOAD_BACKOFF_SECS[(attempt - 1) as usize];
                warn!(file = %basename(path), attempt, wait, error = %last_err, "retrying upload");
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
        }
        Err(OcrError::UploadFailed {
            name: basename(path),
            attempts: UPLOAD_MAX_RETRIES,
            reason: last_err,
        })
    }

    /// Upload one batch (≤ [`BATCH_SIZE`] files). Returns the batch id (empty
    /// if every file failed local validation), the uploaded `(path, task_key)`
    /// pairs, and `(task_key, error)` failures.
    async fn upload_batch(
        &self,
        file_items: &[(String, String)],
    ) -> Result<(String, Vec<(String, String)>, Vec<(String, String)>), OcrError> {
        let mut valid_items = Vec::new();
        let mut failed_items = Vec::new();

        for (path, key) in file_items {
            match Self::validate_file_size(path) {
                Ok(()) => valid_items.push((path.clone(), key.clone())),
                Err(e) => {
                    error!(file = %basename(path), error = %e, "pre-upload validation failed");
                    failed_items.push((key.clone(), format!("validation failed: {e}")));
                }
            }
        }

        if valid_items.is_empty() {
            warn!(failed = failed_items.len(), total = file_items.len(), "batch skipped: all files failed validation");
            return Ok((String::new(), Vec::new(), failed_items));
        }

        let entries: Vec<Value> = valid_items
            .iter()
            .map(|(path, key)| json!({"name": basename(path), "data_id": key}))
            .collect();

        let (batch_id, urls) = self.request_upload_urls(&entries).await?;
        if urls.len() != valid_items.len() {
            return Err(OcrError::BatchRequest(format!(
                "expected {} upload URLs, got {}",
                valid_items.len(),
                urls.len()
            )));
        }

        info!(batch_id, files = urls.len(), "starting batch upload");
        let mut uploaded = Vec::new();
        for (i, url) in urls.iter().enumerate() {
            let (path, key) = &valid_items[i];
            match self.upload_file(url, path).await {
                Ok(()) => uploaded.push((path.clone(), key.clone())),
                Err(e) => {
                    error!(file = %basename(path), error = %e, "upload failed");
                    failed_items.push((key.clone(), e.to_string()));
                }
            }
        }
        info!(batch_id, uploaded = uploaded.len(), failed = failed_items.len(), "batch upload complete");
        Ok((batch_id, uploaded, failed_items))
    }

    /// Poll a batch until every task reaches a terminal state or the
    /// configured timeout elapses.
    async fn poll_batch(&self, batch_id: &str, expected_keys: &[String]) -> Result<Vec<Value>, OcrError> {
        let expected: std::collections::HashSet<&str> = expected_keys.iter().map(|s| s.as_str()).collect();
        let start = Instant::now();
        loop {
            if start.elapsed() > self.poll_timeout {
                return Err(OcrError::PollTimeout {
                    batch_id: batch_id.to_string(),
                    timeout_secs: self.poll_timeout.as_secs(),
                });
            }
            let resp = self
                .http
                .get(format!("{}/extract-results/batch/{batch_id}", self.base_url))
                .header("Authorization", self.auth_header())
                .timeout(Duration::from_secs(30))
                .send()
                .await?;
            let body: Value = resp.error_for_status()?.json().await?;
            let results = body["data"]["extract_result"].as_array().cloned().unwrap_or_default();

            if results.is_empty() {
                warn!(batch_id, "no results yet");
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            let is_terminal = |r: &Value| matches!(r.get("state").and_then(|v| v.as_str()), Some("done") | Some("failed"));

            let terminal_keys: std::collections::HashSet<&str> = results
                .iter()
                .filter(|r| is_terminal(r) && r.get("data_id").and_then(|v| v.as_str()).map(|k| expected.contains(k)).unwrap_or(false))
                .filter_map(|r| r.get("data_id").and_then(|v| v.as_str()))
                .collect();
            if expected.is_subset(&terminal_keys) {
                return Ok(results);
            }
            if results.iter().all(is_terminal) {
                return Ok(results);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Download each terminal result's zip and extract its markdown.
    async fn download_markdown(&self, results: &[Value]) -> (HashMap<String, OcrResult>, HashMap<String, String>) {
        let mut successes = HashMap::new();
        let mut failures = HashMap::new();

        for r in results {
            let data_id = r
                .get("data_id")
                .and_then(|v| v.as_str())
                .or_else(|| r.get("file_name").and_then(|v| v.as_str()))
                .unwrap_or("unknown")
                .to_string();
            let file_name = r.get("file_name").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();

            if r.get("state").and_then(|v| v.as_str()) == Some("failed") {
                let err = r.get("err_msg").and_then(|v| v.as_str()).unwrap_or("unknown error").to_string();
                warn!(file_name, error = %err, "OCR parsing failed");
                failures.insert(data_id, err);
                continue;
            }

            let Some(zip_url) = r.get("full_zip_url").and_then(|v| v.as_str()) else {
                failures.insert(data_id, "no zip URL in done result".to_string());
                continue;
            };

            let zip_bytes = match self.http.get(zip_url).timeout(Duration::from_secs(120)).send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => resp.bytes().await.ok(),
                    Err(e) => {
                        error!(file_name, error = %e, "zip download returned error status");
                        failures.insert(data_id.clone(), format!("zip download error: {e}"));
                        None
                    }
                },
                Err(e) => {
                    error!(file_name, error = %e, "zip download failed");
                    failures.insert(data_id.clone(), format!("zip download error: {e}"));
                    None
                }
            };
            let Some(zip_bytes) = zip_bytes else { continue };

            match extract_md_from_zip(&zip_bytes) {
                Some(text) => {
                    let assets = extract_assets_from_zip(&zip_bytes, &data_id, &self.asset_output_dir).unwrap_or_else(|e| {
                        warn!(file_name, error = %e, "failed to extract image assets from zip");
                        Vec::new()
                    });
                    successes.insert(data_id, OcrResult { text, file_name, assets });
                }
                None => {
                    warn!(file_name, "no .md file found in zip");
                    failures.insert(data_id, "no .md file found in zip".to_string());
                }
            }
        }
        (successes, failures)
    }

    /// Upload, poll, and download markdown for every file in `file_map`,
    /// chunked into batches of [`BATCH_SIZE`]. `cancel` is consulted between
    /// batches; once set, remaining files are reported as failures (with a
    /// "cancelled" error) without starting further upload/poll work.
    pub async fn process_files(
        &self,
        file_map: &[(String, String)],
        cancel: &CancellationToken,
    ) -> (HashMap<String, OcrResult>, HashMap<String, String>) {
        let mut all_successes = HashMap::new();
        let mut all_failures = HashMap::new();

        let total_batches = file_map.len().div_ceil(BATCH_SIZE);
        let mut batches = file_map.chunks(BATCH_SIZE).enumerate();
        while let Some((batch_num, batch)) = batches.next() {
            if cancel.is_cancelled() {
                info!(batch = batch_num + 1, total_batches, "OCR stage cancelled, skipping remaining batches");
                for (_, key) in batch {
                    all_failures.insert(key.clone(), "cancelled".to_string());
                }
                for (_, remaining) in batches {
                    for (_, key) in remaining {
                        all_failures.insert(key.clone(), "cancelled".to_string());
                    }
                }
                break;
            }

            info!(batch = batch_num + 1, total_batches, files = batch.len(), "processing OCR batch");

            let (batch_id, uploaded, upload_failed) = match self.upload_batch(batch).await {
                Ok(r) => r,
                Err(e) => {
                    error!(batch = batch_num + 1, error = %e, "batch initialization failed");
                    for (_, key) in batch {
                        all_failures.insert(key.clone(), format!("upload error: {e}"));
                    }
                    continue;
                }
            };
            for (key, err) in upload_failed {
                all_failures.insert(key, format!("upload error: {err}"));
            }
            if uploaded.is_empty() {
                warn!(batch = batch_num + 1, "all uploads failed, skipping poll");
                continue;
            }

            let expected_keys: Vec<String> = uploaded.iter().map(|(_, key)| key.clone()).collect();
            match self.poll_batch(&batch_id, &expected_keys).await {
                Ok(results) => {
                    let (successes, failures) = self.download_markdown(&results).await;
                    info!(batch = batch_num + 1, succeeded = successes.len(), failed = failures.len(), "batch complete");
                    all_successes.extend(successes);
                    all_failures.extend(failures);
                }
                Err(e) => {
                    error!(batch = batch_num + 1, error = %e, "poll/download failed");
                    for (_, key) in &uploaded {
                        all_failures.insert(key.clone(), format!("poll/download error: {e}"));
                    }
                }
            }
        }
        (all_successes, all_failures)
    }
}

fn basename(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string()
}

fn extract_md_from_zip(bytes: &[u8]) -> Option<String> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader).ok()?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).ok()?;
        if entry.name().ends_with(".md") {
            let mut content = String::new();
            entry.read_to_string(&mut content).ok()?;
            return Some(content);
        }
    }
    None
}

/// Extract every recognized image entry of the zip to
/// `asset_output_dir/<task_key>/`, preserving the archive's relative path
/// so it matches the Markdown's image references (§4.2 asset extraction).
fn extract_assets_from_zip(bytes: &[u8], task_key: &str, asset_output_dir: &Path) -> Result<Vec<ImageAsset>, OcrError> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader)?;
    let safe_key = task_key.replace(['/', '\\', '#'], "_");
    let dest_root = asset_output_dir.join(&safe_key);

    let mut assets = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let archive_path = entry.name().to_string();
        let ext = Path::new(&archive_path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !IMAGE_ASSET_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        let Some(enclosed) = entry.enclosed_name() else {
            warn!(archive_path, task_key, "skipping zip entry with unsafe path");
            continue;
        };
        let dest_path = dest_root.join(&enclosed);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::new();
        std::io::copy(&mut entry, &mut buf)?;
        std::fs::write(&dest_path, &buf)?;

        let name = enclosed.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        assets.push(ImageAsset {
            disk_path: dest_path.to_string_lossy().into_owned(),
            name,
            link_path: archive_path.clone(),
            archive_path,
        });
    }
    Ok(assets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_zip(name: &str, content: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut zip = zip::ZipWriter::new(cursor);
            zip.start_file(name, zip::write::SimpleFileOptions::default()).unwrap();
            use std::io::Write;
            zip.write_all(content).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn extract_md_picks_first_markdown_entry() {
        let zip_bytes = make_zip("result.md", b"# Title\ntext");
        let text = extract_md_from_zip(&zip_bytes).unwrap();
        assert_eq!(text, "# Title\ntext");
    }

    #[test]
    fn extract_md_returns_none_without_markdown() {
        let zip_bytes = make_zip("image.png", b"not markdown");
        assert!(extract_md_from_zip(&zip_bytes).is_none());
    }

    #[test]
    fn basename_strips_directory() {
        assert_eq!(basename("/a/b/c.pdf"), "c.pdf");
    }

    fn make_multi_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut zip = zip::ZipWriter::new(cursor);
            use std::io::Write;
            for (name, content) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default()).unwrap();
                zip.write_all(content).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn extract_assets_writes_images_and_skips_non_image_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_bytes = make_multi_zip(&[
            ("result.md", b"# Title"),
            ("images/fig1.png", b"fakepngbytes"),
            ("notes.txt", b"ignore me"),
        ]);
        let assets = extract_assets_from_zip(&zip_bytes, "ABC123#0", dir.path()).unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].name, "fig1.png");
        assert!(Path::new(&assets[0].disk_path).is_file());
        assert_eq!(std::fs::read(&assets[0].disk_path).unwrap(), b"fakepngbytes");
    }
}
