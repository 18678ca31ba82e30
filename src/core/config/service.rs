use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};

use super::paths::AppPaths;
use super::settings::AppConfig;
use super::validation::validate_config;
use crate::core::errors::ApiError;

const REDACT_PLACEHOLDER: &str = "****";

const SENSITIVE_PATTERNS: [&str; 6] = [
    "api_key",
    "secret",
    "password",
    "_token",
    "credential",
    "bearer",
];

const SENSITIVE_WHITELIST: [&str; 2] = ["max_tokens", "max_completion_tokens"];

#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("BLINKCHAT_CONFIG_PATH") {
            return PathBuf::from(path);
        }

        let user_config = self.paths.user_data_dir.join("config.yml");
        if user_config.exists() {
            return user_config;
        }

        self.paths.project_root.join("config.yml")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.paths.secrets_path.clone()
    }

    /// Public config with `secrets.yaml` merged over it.
    pub fn load_config(&self) -> Result<Value, ApiError> {
        let public_config = load_yaml_file(&self.config_path())?;
        let secrets_config = load_yaml_file(&self.secrets_path())?;
        Ok(deep_merge(&public_config, &secrets_config))
    }

    /// Validated, typed settings. `PORT` overrides `server.port`.
    pub fn load_settings(&self) -> Result<AppConfig, ApiError> {
        let merged = self.load_config()?;
        validate_config(&merged)?;

        tracing::debug!(
            config = %redact_sensitive_values(&merged),
            "Effective configuration"
        );

        let mut settings: AppConfig = serde_json::from_value(merged)
            .map_err(|err| ApiError::BadRequest(format!("Invalid config: {}", err)))?;

        if let Ok(raw_port) = env::var("PORT") {
            match raw_port.trim().parse::<u16>() {
                Ok(port) => settings.server.port = port,
                Err(_) => tracing::warn!(value = %raw_port, "Ignoring invalid PORT override"),
            }
        }

        Ok(settings)
    }
}

/// A missing file is an empty document; a malformed one is an error.
fn load_yaml_file(path: &Path) -> Result<Value, ApiError> {
    if !path.exists() {
        return Ok(Value::Object(Map::new()));
    }

    let contents = fs::read_to_string(path).map_err(ApiError::internal)?;
    if contents.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let value = serde_yaml::from_str::<Value>(&contents).map_err(|err| {
        ApiError::BadRequest(format!("Failed to parse {}: {}", path.display(), err))
    })?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Null => Ok(Value::Object(Map::new())),
        _ => Err(ApiError::BadRequest(format!(
            "Invalid config at '{}': expected a mapping",
            path.display()
        ))),
    }
}

fn deep_merge(base: &Value, override_value: &Value) -> Value {
    match (base, override_value) {
        (Value::Object(base_map), Value::Object(override_map)) => {
            let mut merged: Map<String, Value> = base_map.clone();
            for (key, value) in override_map {
                let merged_value = match merged.get(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        _ => override_value.clone(),
    }
}

fn redact_sensitive_values(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = Map::new();
            for (key, val) in map {
                if is_sensitive_key(key) && !val.is_null() {
                    redacted.insert(key.clone(), Value::String(REDACT_PLACEHOLDER.to_string()));
                } else {
                    redacted.insert(key.clone(), redact_sensitive_values(val));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_values).collect()),
        _ => value.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    if SENSITIVE_WHITELIST
        .iter()
        .any(|allowed| *allowed == key_lower)
    {
        return false;
    }
    SENSITIVE_PATTERNS
        .iter()
        .any(|pattern| key_lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_merges_objects_and_overrides_scalars() {
        let base = json!({
            "storage": { "qdrant_url": "http://localhost:6333", "history_db": "history.db" },
            "server": { "cors_allowed_origins": ["http://a"] }
        });
        let override_value = json!({
            "storage": { "qdrant_api_key": "k" },
            "server": { "cors_allowed_origins": ["http://b"] }
        });

        let merged = deep_merge(&base, &override_value);

        assert_eq!(
            merged,
            json!({
                "storage": {
                    "qdrant_url": "http://localhost:6333",
                    "history_db": "history.db",
                    "qdrant_api_key": "k"
                },
                "server": { "cors_allowed_origins": ["http://b"] }
            })
        );
    }

    #[test]
    fn redact_sensitive_values_replaces_secrets_only() {
        let input = json!({
            "storage": { "qdrant_api_key": "secret", "qdrant_url": "http://q" },
            "chat": { "agent": { "max_completion_tokens": 512 } }
        });

        let redacted = redact_sensitive_values(&input);

        assert_eq!(
            redacted,
            json!({
                "storage": { "qdrant_api_key": "****", "qdrant_url": "http://q" },
                "chat": { "agent": { "max_completion_tokens": 512 } }
            })
        );
    }

    #[test]
    fn secrets_file_overrides_public_config() {
        let root = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        fs::write(
            root.path().join("config.yml"),
            "rag:\n  collection_name: Docs\nstorage:\n  qdrant_url: http://q:6333\n",
        )
        .unwrap();
        fs::write(
            data.path().join("secrets.yaml"),
            "storage:\n  qdrant_api_key: abc\n",
        )
        .unwrap();

        let paths = AppPaths::with_dirs(root.path().to_path_buf(), data.path().to_path_buf());
        let service = ConfigService::new(Arc::new(paths));
        let config = service.load_config().unwrap();

        assert_eq!(config["rag"]["collection_name"], "Docs");
        assert_eq!(config["storage"]["qdrant_url"], "http://q:6333");
        assert_eq!(config["storage"]["qdrant_api_key"], "abc");
    }

    #[test]
    fn malformed_yaml_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "server: [unterminated").unwrap();

        let err = load_yaml_file(&path).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }
}
