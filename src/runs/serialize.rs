//! Conversion of agent output into a document safe to persist as JSONB.

use serde::Serialize;
use serde_json::{Map, Value, json};

const MAX_DEPTH: usize = 128;

const MESSAGE_TYPES: &[&str] = &[
    "human",
    "ai",
    "system",
    "tool",
    "HumanMessage",
    "AIMessage",
    "AIMessageChunk",
    "SystemMessage",
    "ToolMessage",
];

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("value is not representable as JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("value nests deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("string contains a NUL character at {path}")]
    NulCharacter { path: String },
}

/// Serialize `value` into a storable document.
///
/// Chat message objects are reduced to their `type`, `content` and
/// `additional_kwargs`. Values Postgres refuses to store in JSONB (NUL
/// characters) and pathologically deep nesting are rejected.
pub fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Value, SerializeError> {
    let raw = serde_json::to_value(value)?;
    sanitize(raw, 0, &mut String::from("$"))
}

/// Storable form of a run's final output: empty output becomes `{}` and a
/// serialization failure becomes a diagnostic placeholder.
pub fn storable_output(output: Option<&Value>) -> Value {
    let Some(output) = output else {
        return json!({});
    };
    match serialize(output) {
        Ok(Value::Null) => json!({}),
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "run output could not be serialized, storing placeholder");
            json!({
                "error": "output could not be serialized",
                "detail": err.to_string(),
            })
        }
    }
}

fn sanitize(value: Value, depth: usize, path: &mut String) -> Result<Value, SerializeError> {
    if depth > MAX_DEPTH {
        return Err(SerializeError::TooDeep);
    }
    match value {
        Value::String(s) => {
            if s.contains('\0') {
                return Err(SerializeError::NulCharacter { path: path.clone() });
            }
            Ok(Value::String(s))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.into_iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                out.push(sanitize(item, depth + 1, path)?);
                path.truncate(len);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) if is_message(&map) => {
            let mut reduced = Map::new();
            for key in ["type", "content", "additional_kwargs"] {
                if let Some(v) = map.get(key) {
                    let len = path.len();
                    path.push('.');
                    path.push_str(key);
                    reduced.insert(key.to_string(), sanitize(v.clone(), depth + 1, path)?);
                    path.truncate(len);
                }
            }
            Ok(Value::Object(reduced))
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                if key.contains('\0') {
                    return Err(SerializeError::NulCharacter { path: path.clone() });
                }
                let len = path.len();
                path.push('.');
                path.push_str(&key);
                let item = sanitize(item, depth + 1, path)?;
                path.truncate(len);
                out.insert(key, item);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other),
    }
}

fn is_message(map: &Map<String, Value>) -> bool {
    map.contains_key("content")
        && map
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|t| MESSAGE_TYPES.contains(&t))
}
