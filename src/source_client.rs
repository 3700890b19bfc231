//! Reference-manager bridge client (C1): JSON-RPC 2.0 over HTTP, paginated
//! collection/item listing, collection-scope expansion, and attachment
//! collection.

use crate::errors::SourceError;
use crate::models::{attachment_task_key, SUPPORTED_EXTENSIONS};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Hard cap on pagination loops, guarding against a misbehaving bridge
/// returning a non-shrinking page forever.
const MAX_PAGES_GUARD: u32 = 500;

pub struct SourceClient {
    http: reqwest::Client,
    mcp_url: String,
}

impl SourceClient {
    pub fn new(mcp_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client build");
        Self {
            http,
            mcp_url: mcp_url.into(),
        }
    }

    async fn mcp_call(&self, method: &str, params: Option<Value>) -> Result<Value, SourceError> {
        let mut payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
        });
        if let Some(params) = params {
            payload["params"] = params;
        }
        let resp = self.http.post(&self.mcp_url).json(&payload).send().await?;
        let body: Value = resp.error_for_status()?.json().await?;
        if let Some(error) = body.get("error") {
            return Err(SourceError::Rpc(error.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or(json!({})))
    }

    async fn tool_call(&self, name: &str, arguments: Value) -> Result<Value, SourceError> {
        let result = self
            .mcp_call("tools/call", Some(json!({"name": name, "arguments": arguments})))
            .await?;
        Ok(parse_mcp_content(&result))
    }

    /// Verify the bridge is reachable and not returning an error envelope.
    pub async fn check_connection(&self) -> bool {
        let payload = json!({"jsonrpc": "2.0", "id": 0, "method": "tools/list"});
        let resp = self
            .http
            .post(&self.mcp_url)
            .timeout(Duration::from_secs(5))
            .json(&payload)
            .send()
            .await;
        match resp {
            Ok(r) => match r.error_for_status() {
                Ok(r) => match r.json::<Value>().await {
                    Ok(body) => body.get("error").is_none(),
                    Err(_) => false,
                },
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    /// List top-level collections (§6, `get_collections`), used by the
    /// control plane's collection-browsing endpoint.
    pub async fn list_collections(&self) -> Result<Vec<Value>, SourceError> {
        paginate(100, |offset, limit| async move {
            self.tool_call("get_collections", json!({"limit": limit, "offset": offset}))
                .await
        })
        .await
    }

    async fn get_subcollections(&self, collection_key: &str, page_size: u32) -> Result<Vec<Value>, SourceError> {
        paginate(page_size, |offset, limit| {
            let key = collection_key.to_string();
            async move {
                self.tool_call(
                    "get_subcollections",
                    json!({"collectionKey": key, "limit": limit, "offset": offset}),
                )
                .await
            }
        })
        .await
    }

    /// BFS-expand a set of collection keys into itself plus all descendant
    /// collections (§4.1).
    pub async fn expand_collection_scope(&self, collection_keys: &[String], recursive: bool) -> Vec<String> {
        let mut effective: HashSet<String> = collection_keys.iter().cloned().collect();
        if !recursive {
            return effective.into_iter().collect();
        }
        let mut queue: VecDeque<String> = collection_keys.iter().cloned().collect();
        while let Some(current) = queue.pop_front() {
            let subs = match self.get_subcollections(&current, 100).await {
                Ok(subs) => subs,
                Err(e) => {
                    warn!(collection = %current, error = %e, "failed to fetch subcollections");
                    continue;
                }
            };
            for sub in subs {
                let sub_key = sub
                    .get("key")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if !sub_key.is_empty() && effective.insert(sub_key.clone()) {
                    queue.push_back(sub_key);
                }
            }
        }
        effective.into_iter().collect()
    }

    async fn iter_collection_items(&self, collection_key: &str, page_size: u32) -> Result<Vec<Value>, SourceError> {
        paginate(page_size, |offset, limit| {
            let key = collection_key.to_string();
            async move {
                self.tool_call(
                    "get_collection_items",
                    json!({"collectionKey": key, "limit": limit, "offset": offset}),
                )
                .await
            }
        })
        .await
    }

    async fn search_all_items(&self, page_size: u32) -> Result<Vec<Value>, SourceError> {
        paginate(page_size, |offset, limit| async move {
            self.tool_call("search_library", json!({"q": "", "limit": limit, "offset": offset}))
                .await
        })
        .await
    }

    async fn collect_items_by_collections(
        &self,
        collection_keys: &[String],
        recursive: bool,
        page_size: u32,
    ) -> Vec<Value> {
        let effective_keys = self.expand_collection_scope(collection_keys, recursive).await;
        tracing::info!(
            input = collection_keys.len(),
            expanded = effective_keys.len(),
            recursive,
            "collection scope expanded"
        );
        let mut seen = HashSet::new();
        let mut all_items = Vec::new();
        for coll_key in &effective_keys {
            let items = match self.iter_collection_items(coll_key, page_size).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(collection = %coll_key, error = %e, "failed to fetch collection items");
                    continue;
                }
            };
            for item in items {
                let item_key = item.get("key").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                if !item_key.is_empty() && seen.insert(item_key) {
                    all_items.push(item);
                }
            }
        }
        all_items
    }

    /// Fetch local file paths for an item's supported attachments.
    async fn get_attachment_paths(&self, item_key: &str) -> Result<Vec<String>, SourceError> {
        let result = self.tool_call("get_item_details", json!({"itemKey": item_key})).await?;
        let attachments = result.get("attachments").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        let mut paths = Vec::new();
        for att in attachments {
            let file_path = att
                .get("filePath")
                .or_else(|| att.get("path"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if file_path.is_empty() {
                continue;
            }
            let ext = Path::new(file_path)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();
            if !SUPPORTED_EXTENSIONS.contains(&ext.as_str()) {
                warn!(item = item_key, ext, "skipping unsupported attachment format");
                continue;
            }
            if !Path::new(file_path).is_file() {
                warn!(item = item_key, path = file_path, "attachment file missing on disk");
                continue;
            }
            paths.push(file_path.to_string());
        }
        Ok(paths)
    }

    /// Collect `{file_path: task_key}` for every not-yet-uploaded item,
    /// scoped to `collection_keys` (or the whole library if empty) (§4.1).
    pub async fn collect_files(
        &self,
        uploaded_item_keys: &HashSet<String>,
        collection_keys: &[String],
        recursive: bool,
        page_size: u32,
    ) -> Vec<(String, String)> {
        let items = if !collection_keys.is_empty() {
            self.collect_items_by_collections(collection_keys, recursive, page_size).await
        } else {
            self.search_all_items(page_size).await.unwrap_or_else(|e| {
                warn!(error = %e, "search_all_items failed");
                Vec::new()
            })
        };

        let mut file_map = Vec::new();
        let mut seen_paths = HashSet::new();
        let mut skipped = 0u32;

        for item in items {
            let item_key = item.get("key").and_then(|v| v.as_str()).unwrap_or_default().to_string();
            if item_key.is_empty() {
                continue;
            }
            if uploaded_item_keys.contains(&item_key) {
                skipped += 1;
                continue;
            }
            let mut paths = match self.get_attachment_paths(&item_key).await {
                Ok(paths) => paths,
                Err(e) => {
                    warn!(item = item_key, error = %e, "failed to fetch attachments");
                    continue;
                }
            };
            paths.sort();
            for (idx, path) in paths.into_iter().enumerate() {
                let task_key = attachment_task_key(&item_key, idx);
                if seen_paths.insert(path.clone()) {
                    file_map.push((path, task_key));
                }
            }
        }

        tracing::info!(files = file_map.len(), skipped, "attachment collection complete");
        file_map
    }
}

/// Drive an MCP paginated listing to completion, extracting a list payload
/// from one of several candidate keys and stopping on a short page.
async fn paginate<F, Fut>(page_size: u32, mut call: F) -> Result<Vec<Value>, SourceError>
where
    F: FnMut(u32, u32) -> Fut,
    Fut: std::future::Future<Output = Result<Value, SourceError>>,
{
    let page_size = page_size.max(1);
    let mut all = Vec::new();
    let mut offset = 0u32;
    for _ in 0..MAX_PAGES_GUARD {
        let result = call(offset, page_size).await?;
        let items = extract_list_payload(&result);
        if items.is_empty() {
            break;
        }
        let page_len = items.len() as u32;
        all.extend(items);
        if page_len < page_size {
            break;
        }
        offset += page_size;
    }
    Ok(all)
}

/// Unwrap the MCP content envelope: `{"content": [{"type": "text", "text":
/// "<json>"}]}`, where the inner JSON may itself be `{"data": ...}`.
/// Falls back to the raw result when the envelope shape doesn't match.
fn parse_mcp_content(result: &Value) -> Value {
    let Some(content) = result.get("content").and_then(|v| v.as_array()) else {
        return result.clone();
    };
    let Some(first) = content.first() else {
        return result.clone();
    };
    let Some(text) = first.get("text").and_then(|v| v.as_str()) else {
        return result.clone();
    };
    match serde_json::from_str::<Value>(text) {
        Ok(parsed) => {
            if let Some(data) = parsed.get("data") {
                if parsed.is_object() {
                    return data.clone();
                }
            }
            parsed
        }
        Err(_) => result.clone(),
    }
}

/// Extract a list from an MCP response payload, trying several known keys
/// (the bridge's tools are not consistent about which key wraps a list).
fn extract_list_payload(data: &Value) -> Vec<Value> {
    if let Some(arr) = data.as_array() {
        return arr.clone();
    }
    for key in ["results", "items", "collections", "subcollections"] {
        if let Some(arr) = data.get(key).and_then(|v| v.as_array()) {
            return arr.clone();
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_list_payload_prefers_results_key() {
        let v = json!({"results": [1, 2], "items": [3]});
        assert_eq!(extract_list_payload(&v), vec![json!(1), json!(2)]);
    }

    #[test]
    fn extract_list_payload_handles_bare_array() {
        let v = json!([1, 2, 3]);
        assert_eq!(extract_list_payload(&v).len(), 3);
    }

    #[test]
    fn extract_list_payload_empty_on_no_match() {
        let v = json!({"foo": "bar"});
        assert!(extract_list_payload(&v).is_empty());
    }

    #[test]
    fn parse_mcp_content_unwraps_text_envelope() {
        let inner = json!({"data": {"results": [1, 2]}});
        let result = json!({"content": [{"type": "text", "text": inner.to_string()}]});
        assert_eq!(parse_mcp_content(&result), json!({"results": [1, 2]}));
    }

    #[test]
    fn parse_mcp_content_falls_back_on_missing_envelope() {
        let result = json!({"attachments": []});
        assert_eq!(parse_mcp_content(&result), result);
    }
}
