use serde_json::{Map, Value};

use super::error::ApiError;

/// Serialized size cap for caller-owned maps (settings, metadata, details).
pub const MAX_METADATA_BYTES: usize = 10 * 1024;

/// Rejects non-object values and objects larger than [`MAX_METADATA_BYTES`].
pub fn check_map(value: &Value, field: &str) -> Result<(), ApiError> {
    if !value.is_object() {
        return Err(ApiError::field(field, "must be a JSON object"));
    }
    let size = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX);
    if size > MAX_METADATA_BYTES {
        return Err(ApiError::field(
            field,
            format!("must be at most {MAX_METADATA_BYTES} bytes when serialized"),
        ));
    }
    Ok(())
}

/// Merges `patch` into `target` key by key. Keys absent from the patch are
/// kept; a `null` value removes the key.
pub fn merge(target: &mut Value, patch: Value) {
    let Value::Object(patch) = patch else {
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(existing) = target {
        for (key, value) in patch {
            if value.is_null() {
                existing.remove(&key);
            } else {
                existing.insert(key, value);
            }
        }
    }
}

pub fn empty_map() -> Value {
    Value::Object(Map::new())
}
