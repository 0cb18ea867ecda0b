//! Schema validation helpers for courier JSON5 configuration.

use crate::ConfigError;
use serde_json::{Map, Value};

/// Validate a single config layer against the schema.
pub(super) fn validate_layer_schema(value: &Value, layer: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, "")?;
    let allowed = [
        "$schema", "session", "queue", "listen", "pull", "poll", "cluster",
    ];
    ensure_allowed_keys(map, &allowed, layer, "")?;

    if let Some(value) = map.get("$schema") {
        expect_string(value, layer, "$schema")?;
    }
    if let Some(value) = map.get("session") {
        validate_session(value, layer, "session")?;
    }
    if let Some(value) = map.get("queue") {
        validate_queue(value, layer, "queue")?;
    }
    if let Some(value) = map.get("listen") {
        validate_listen(value, layer, "listen")?;
    }
    if let Some(value) = map.get("pull") {
        validate_refresh(value, layer, "pull")?;
    }
    if let Some(value) = map.get("poll") {
        validate_refresh(value, layer, "poll")?;
    }
    if let Some(value) = map.get("cluster") {
        validate_cluster(value, layer, "cluster")?;
    }

    Ok(())
}

/// Validate the "session" block.
fn validate_session(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &["timeout_mins", "id_size", "id_generation"],
        layer,
        path,
    )?;
    if let Some(value) = map.get("timeout_mins") {
        expect_u64(value, layer, &join_path(path, "timeout_mins"))?;
    }
    if let Some(value) = map.get("id_size") {
        expect_u64(value, layer, &join_path(path, "id_size"))?;
    }
    if let Some(value) = map.get("id_generation") {
        expect_one_of(
            value,
            &["randomstring", "uuid"],
            layer,
            &join_path(path, "id_generation"),
        )?;
    }
    Ok(())
}

/// Validate the "queue" block.
fn validate_queue(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &[
            "size",
            "read_timeout_millis",
            "write_timeout_millis",
            "poll_interval_millis",
            "backend",
        ],
        layer,
        path,
    )?;
    for key in [
        "size",
        "read_timeout_millis",
        "write_timeout_millis",
        "poll_interval_millis",
    ] {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    if let Some(value) = map.get("backend") {
        expect_one_of(
            value,
            &["store", "memory"],
            layer,
            &join_path(path, "backend"),
        )?;
    }
    Ok(())
}

/// Validate the "listen" block.
fn validate_listen(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(map, &["force_pull_all", "force_pull_agents"], layer, path)?;
    if let Some(value) = map.get("force_pull_all") {
        expect_bool(value, layer, &join_path(path, "force_pull_all"))?;
    }
    if let Some(value) = map.get("force_pull_agents") {
        validate_string_array(value, layer, &join_path(path, "force_pull_agents"))?;
    }
    Ok(())
}

/// Validate a "pull" or "poll" block.
fn validate_refresh(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    let keys = ["refresh_timeout_millis", "wait_min_millis", "wait_max_millis"];
    ensure_allowed_keys(map, &keys, layer, path)?;
    for key in keys {
        if let Some(value) = map.get(key) {
            expect_u64(value, layer, &join_path(path, key))?;
        }
    }
    Ok(())
}

/// Validate the "cluster" block.
fn validate_cluster(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let map = expect_object(value, layer, path)?;
    ensure_allowed_keys(
        map,
        &[
            "node_id",
            "aging_interval_millis",
            "aging_lock_stale_millis",
            "page_size",
        ],
        layer,
        path,
    )?;
    if let Some(value) = map.get("node_id")
        && !value.is_null()
    {
        expect_string(value, layer, &join_path(path, "node_id"))?;
    }
    if let Some(value) = map.get("aging_interval_millis") {
        expect_u64(value, layer, &join_path(path, "aging_interval_millis"))?;
    }
    if let Some(value) = map.get("aging_lock_stale_millis")
        && !value.is_null()
    {
        expect_u64(value, layer, &join_path(path, "aging_lock_stale_millis"))?;
    }
    if let Some(value) = map.get("page_size") {
        expect_u64(value, layer, &join_path(path, "page_size"))?;
    }
    Ok(())
}

/// Expect a JSON object or return a typed error.
fn expect_object<'a>(
    value: &'a Value,
    layer: &str,
    path: &str,
) -> Result<&'a Map<String, Value>, ConfigError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(invalid_field(layer, path, "expected object")),
    }
}

/// Expect a JSON string or return a typed error.
fn expect_string(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.as_str().is_some() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected string"))
    }
}

/// Expect one of a fixed set of strings.
fn expect_one_of(
    value: &Value,
    allowed: &[&str],
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    match value.as_str() {
        Some(text) if allowed.contains(&text) => Ok(()),
        Some(_) => Err(invalid_field(
            layer,
            path,
            &format!("expected one of {}", allowed.join(", ")),
        )),
        None => Err(invalid_field(layer, path, "expected string")),
    }
}

/// Expect a JSON boolean or return a typed error.
fn expect_bool(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if matches!(value, Value::Bool(_)) {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected bool"))
    }
}

/// Expect a non-negative JSON integer or return a typed error.
fn expect_u64(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    if value.is_u64() {
        Ok(())
    } else {
        Err(invalid_field(layer, path, "expected non-negative integer"))
    }
}

/// Validate that a value is an array of strings.
fn validate_string_array(value: &Value, layer: &str, path: &str) -> Result<(), ConfigError> {
    let arr = match value {
        Value::Array(arr) => arr,
        _ => return Err(invalid_field(layer, path, "expected array")),
    };
    for (idx, entry) in arr.iter().enumerate() {
        if entry.as_str().is_none() {
            return Err(invalid_field(
                layer,
                &format!("{path}[{idx}]"),
                "expected string",
            ));
        }
    }
    Ok(())
}

/// Ensure an object contains only allowed keys.
fn ensure_allowed_keys(
    map: &Map<String, Value>,
    allowed: &[&str],
    layer: &str,
    path: &str,
) -> Result<(), ConfigError> {
    for key in map.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(invalid_field(layer, &join_path(path, key), "unknown key"));
        }
    }
    Ok(())
}

/// Join nested paths for better error messages.
fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Build a structured invalid-field error.
fn invalid_field(layer: &str, path: &str, message: &str) -> ConfigError {
    let normalized_path = if path.is_empty() { "root" } else { path };
    ConfigError::InvalidField {
        path: format!("{layer}:{normalized_path}"),
        message: message.to_string(),
    }
}
