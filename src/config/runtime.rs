//! Versioned, lock-protected runtime configuration provider (C9).
//!
//! JSON-persisted with atomic tmp-file-then-rename writes, matching the
//! teacher's persistence idiom elsewhere in this crate. Unlike the small
//! bootstrap config (`config::bootstrap`), this is mutable at runtime
//! through the HTTP control plane and is the system's real configuration
//! surface (SPEC_FULL.md §10).

use crate::config::schema::{build_defaults, mask_sensitive, validate_and_coerce, ENV_KEY_MAP};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedConfig {
    version: u64,
    data: Value,
}

/// Thread-safe provider for the six-category runtime configuration.
pub struct RuntimeConfigProvider {
    path: PathBuf,
    state: RwLock<ConfigState>,
}

struct ConfigState {
    data: Value,
    version: u64,
}

impl RuntimeConfigProvider {
    pub fn new(path: PathBuf) -> Result<Self, ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let state = Self::load_or_init(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn load_or_init(path: &Path) -> Result<ConfigState, ConfigError> {
        if path.exists() {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(persisted) = serde_json::from_str::<PersistedConfig>(&raw) {
                    return Ok(ConfigState {
                        data: validate_and_coerce(&persisted.data),
                        version: persisted.version,
                    });
                }
            }
            // Corrupt or unreadable file: fall through to defaults rather
            // than error out, matching the Python provider's behavior.
        }

        let mut data = build_defaults();
        let mut version = 0u64;
        let env_path = path
            .parent()
            .and_then(|d| d.parent())
            .map(|root| root.join(".env"))
            .unwrap_or_else(|| PathBuf::from(".env"));
        if env_path.exists() {
            let env_values = parse_env_file(&env_path);
            if apply_env_patch(&mut data, &env_values) {
                version = 1;
            }
        }
        let state = ConfigState { data, version };
        Self::persist(path, &state)?;
        Ok(state)
    }

    fn persist(path: &Path, state: &ConfigState) -> Result<(), ConfigError> {
        let payload = PersistedConfig {
            version: state.version,
            data: state.data.clone(),
        };
        let body = serde_json::to_string_pretty(&payload)?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("runtime_config.json")
        ));
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Deep-copied, unmasked snapshot for internal consumers (pipeline,
    /// clients). Never serialize this over HTTP.
    pub fn snapshot(&self) -> Value {
        self.state.read().expect("config lock poisoned").data.clone()
    }

    pub fn version(&self) -> u64 {
        self.state.read().expect("config lock poisoned").version
    }

    /// Masked snapshot safe to return from the HTTP control plane.
    pub fn masked(&self) -> Value {
        let guard = self.state.read().expect("config lock poisoned");
        mask_sensitive(&guard.data)
    }

    /// Merge `patch` into the current config, rejecting masked-echo values
    /// for sensitive fields so a round-tripped masked value never clobbers
    /// the real secret, then validate, persist, and bump the version.
    pub fn update(&self, patch: &Value) -> Result<Value, ConfigError> {
        let mut guard = self.state.write().expect("config lock poisoned");
        let current_masked = mask_sensitive(&guard.data);
        let mut merged = guard.data.clone();
        if let (Some(patch_obj), Some(merged_obj)) = (patch.as_object(), merged.as_object_mut()) {
            for (category, fields) in patch_obj {
                let Some(fields_obj) = fields.as_object() else {
                    continue;
                };
                let cat_entry = merged_obj
                    .entry(category.clone())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                let Some(cat_map) = cat_entry.as_object_mut() else {
                    continue;
                };
                for (key, value) in fields_obj {
                    let spec = crate::config::schema::find_field(category, key);
                    if let (Some(spec), Value::String(s)) = (spec, value) {
                        if spec.sensitive {
                            let existing_masked = current_masked
                                .get(category)
                                .and_then(|c| c.get(key))
                                .and_then(|v| v.as_str());
                            if existing_masked == Some(s.as_str()) {
                                continue;
                            }
                        }
                    }
                    cat_map.insert(key.clone(), value.clone());
                }
            }
        }
        let validated = validate_and_coerce(&merged);
        guard.data = validated;
        guard.version += 1;
        Self::persist(&self.path, &guard)?;
        Ok(mask_sensitive(&guard.data))
    }

    /// Import `.env` values through `ENV_KEY_MAP`, applying them as a patch
    /// (so masked-echo protection and validation still apply).
    pub fn import_env(&self, env_path: &Path) -> Result<Value, ConfigError> {
        let env_values = parse_env_file(env_path);
        let mut patch = serde_json::Map::new();
        for (env_key, value) in &env_values {
            let Some((category, key)) = ENV_KEY_MAP.get(env_key.as_str()) else {
                continue;
            };
            patch
                .entry(category.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .expect("just inserted as object")
                .insert(key.to_string(), Value::String(value.clone()));
        }
        if patch.is_empty() {
            let guard = self.state.read().expect("config lock poisoned");
            return Ok(mask_sensitive(&guard.data));
        }
        self.update(&Value::Object(patch))
    }

    pub fn reset_to_defaults(&self) -> Result<Value, ConfigError> {
        let mut guard = self.state.write().expect("config lock poisoned");
        guard.data = build_defaults();
        guard.version += 1;
        Self::persist(&self.path, &guard)?;
        Ok(mask_sensitive(&guard.data))
    }
}

/// Apply an `.env`-derived patch to a defaults tree in place, returning
/// whether anything was applied (used only at first-run bootstrap, before
/// there's a `ConfigState` to route through `update`'s masked-echo logic).
fn apply_env_patch(data: &mut Value, env_values: &HashMap<String, String>) -> bool {
    let mut applied = false;
    let Some(root) = data.as_object_mut() else {
        return false;
    };
    for (env_key, value) in env_values {
        let Some((category, key)) = ENV_KEY_MAP.get(env_key.as_str()) else {
            continue;
        };
        if let Some(cat) = root.get_mut(*category).and_then(|v| v.as_object_mut()) {
            cat.insert(key.to_string(), Value::String(value.clone()));
            applied = true;
        }
    }
    if applied {
        *data = validate_and_coerce(data);
    }
    applied
}

fn parse_env_file(path: &Path) -> HashMap<String, String> {
    let mut result = HashMap::new();
    let Ok(content) = std::fs::read_to_string(path) else {
        return result;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let mut value = value.trim().to_string();
        if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
            || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
        {
            value = value[1..value.len() - 1].to_string();
        }
        result.insert(key, value);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_sensitive_field_is_fixed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let provider = RuntimeConfigProvider::new(path).unwrap();
        let patch = serde_json::json!({"mineru": {"api_token": "sk-abcdefghij"}});
        let masked = provider.update(&patch).unwrap();
        assert_eq!(masked["mineru"]["api_token"], "******ghij");
    }

    #[test]
    fn masked_echo_does_not_clobber_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let provider = RuntimeConfigProvider::new(path).unwrap();
        provider
            .update(&serde_json::json!({"mineru": {"api_token": "sk-abcdefghij"}}))
            .unwrap();
        let masked = provider
            .update(&serde_json::json!({"mineru": {"api_token": "******ghij"}}))
            .unwrap();
        assert_eq!(masked["mineru"]["api_token"], "******ghij");
        assert_eq!(provider.snapshot()["mineru"]["api_token"], "sk-abcdefghij");
    }

    #[test]
    fn version_increments_on_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        let provider = RuntimeConfigProvider::new(path).unwrap();
        let v0 = provider.version();
        provider
            .update(&serde_json::json!({"zotero": {"mcp_url": "http://example/mcp"}}))
            .unwrap();
        assert_eq!(provider.version(), v0 + 1);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime_config.json");
        std::fs::write(&path, "not json").unwrap();
        let provider = RuntimeConfigProvider::new(path).unwrap();
        assert_eq!(provider.snapshot()["dify"]["dataset_name"], "Zotero Literature");
    }
}
