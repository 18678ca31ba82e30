use serde_json::{Map, Value};

use crate::core::errors::ApiError;

pub fn validate_config(config: &Value) -> Result<(), ApiError> {
    let root = config
        .as_object()
        .ok_or_else(|| config_type_error("root", "object"))?;

    if let Some(server) = expect_optional_object(root, "server")? {
        validate_optional_string_field(server, "server.host", "host")?;
        validate_u64_field(server, "server.port", "port", 0, 65535)?;
        validate_string_array_field(
            server,
            "server.cors_allowed_origins",
            "cors_allowed_origins",
        )?;
    }

    if let Some(llm) = expect_optional_object(root, "llm")? {
        validate_optional_string_field(llm, "llm.server_binary", "server_binary")?;
        validate_optional_string_field(llm, "llm.models_dir", "models_dir")?;
        for key in ["model", "embedding_model"] {
            if let Some(model) = expect_optional_object(llm, key)? {
                let prefix = format!("llm.{}", key);
                validate_optional_string_field(model, &format!("{}.name", prefix), "name")?;
                validate_optional_string_field(model, &format!("{}.uri", prefix), "uri")?;
            }
        }
        validate_enum_field(
            llm,
            "llm.prompt_template",
            "prompt_template",
            &["chatml", "gemma"],
        )?;
        validate_u64_field(llm, "llm.context_size", "context_size", 256, 1_000_000)?;
        validate_i64_field(llm, "llm.n_gpu_layers", "n_gpu_layers", -1, 1_000_000)?;
        validate_bool_field(llm, "llm.gpu", "gpu")?;
        validate_u64_field(llm, "llm.generation_port", "generation_port", 1, 65535)?;
        validate_u64_field(llm, "llm.embedding_port", "embedding_port", 1, 65535)?;
        validate_u64_field(llm, "llm.load_timeout_secs", "load_timeout_secs", 1, 86_400)?;
    }

    if let Some(chat) = expect_optional_object(root, "chat")? {
        validate_u64_field(
            chat,
            "chat.generation_timeout_secs",
            "generation_timeout_secs",
            1,
            86_400,
        )?;
        validate_optional_string_field(chat, "chat.reset_message", "reset_message")?;
        validate_optional_string_field(chat, "chat.fallback_message", "fallback_message")?;
        validate_bool_field(chat, "chat.persist_fallback_turns", "persist_fallback_turns")?;
        for key in ["assistant", "agent"] {
            if let Some(profile) = expect_optional_object(chat, key)? {
                let prefix = format!("chat.{}", key);
                validate_optional_string_field(
                    profile,
                    &format!("{}.system_prompt", prefix),
                    "system_prompt",
                )?;
                validate_u64_field(
                    profile,
                    &format!("{}.max_completion_tokens", prefix),
                    "max_completion_tokens",
                    1,
                    1_000_000,
                )?;
            }
        }
    }

    if let Some(rag) = expect_optional_object(root, "rag")? {
        validate_optional_string_field(rag, "rag.collection_name", "collection_name")?;
        validate_optional_string_field(rag, "rag.source_dir", "source_dir")?;
        validate_u64_field(rag, "rag.max_chunk_size", "max_chunk_size", 16, 100_000)?;
        validate_u64_field(rag, "rag.top_k_gpu", "top_k_gpu", 1, 1_000)?;
        validate_u64_field(rag, "rag.top_k_cpu", "top_k_cpu", 1, 1_000)?;
        validate_bool_field(rag, "rag.force_unique_section", "force_unique_section")?;
        validate_f64_field(rag, "rag.min_relevance_score", "min_relevance_score", -1.0, 1.0)?;
    }

    if let Some(storage) = expect_optional_object(root, "storage")? {
        validate_optional_string_field(storage, "storage.history_db", "history_db")?;
        validate_optional_string_field(storage, "storage.embeddings_db", "embeddings_db")?;
        validate_optional_string_field(storage, "storage.qdrant_url", "qdrant_url")?;
        validate_optional_string_field(storage, "storage.qdrant_api_key", "qdrant_api_key")?;
    }

    Ok(())
}

fn expect_optional_object<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, ApiError> {
    match root.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(config_type_error(key, "object")),
    }
}

fn validate_bool_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.is_null() || value.as_bool().is_some() {
        return Ok(());
    }
    Err(config_type_error(path, "boolean"))
}

fn validate_u64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: u64,
    max: u64,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_u64() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(range_error(path, min, max));
    }
    Ok(())
}

fn validate_i64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: i64,
    max: i64,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_i64() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(range_error(path, min, max));
    }
    Ok(())
}

fn validate_f64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: f64,
    max: f64,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_f64() else {
        return Err(config_type_error(path, "number"));
    };
    if number < min || number > max {
        return Err(range_error(path, min, max));
    }
    Ok(())
}

fn validate_enum_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    allowed: &[&str],
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(text) = value.as_str() else {
        return Err(config_type_error(path, "string"));
    };
    if allowed.contains(&text) {
        return Ok(());
    }
    Err(ApiError::BadRequest(format!(
        "Invalid config at '{}': expected one of {}",
        path,
        allowed.join(", ")
    )))
}

fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.is_null() || value.as_str().is_some() {
        return Ok(());
    }
    Err(config_type_error(path, "string"))
}

fn validate_string_array_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), ApiError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(items) = value.as_array() else {
        return Err(config_type_error(path, "array of strings"));
    };
    for (index, item) in items.iter().enumerate() {
        let Some(text) = item.as_str() else {
            return Err(config_type_error(&format!("{}[{}]", path, index), "string"));
        };
        if text.trim().is_empty() {
            return Err(ApiError::BadRequest(format!(
                "Invalid config at '{}[{}]': value cannot be empty",
                path, index
            )));
        }
    }
    Ok(())
}

fn range_error<T: std::fmt::Display>(path: &str, min: T, max: T) -> ApiError {
    ApiError::BadRequest(format!(
        "Invalid config at '{}': must be between {} and {}",
        path, min, max
    ))
}

fn config_type_error(path: &str, expected: &str) -> ApiError {
    ApiError::BadRequest(format!(
        "Invalid config at '{}': expected {}",
        path, expected
    ))
}
