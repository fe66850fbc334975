//! Classification of decoded agent replies into [`NormalizedEnvelope`]s.
//!
//! The upstream service has no fixed schema, so a reply can be a bare string,
//! a number, an envelope-like object, an object wrapping another reply under
//! `response`, or anything else. [`normalize`] walks an ordered list of rules
//! and the first rule that accepts the value produces the envelope:
//!
//! | # | shape                              | outcome                                   |
//! |---|------------------------------------|-------------------------------------------|
//! | 1 | `null` / `""` / `0` / `false`      | error, `{}`, "Empty response from agent"  |
//! | 2 | string                             | success, `{text}`                         |
//! | 3 | number / boolean                   | success, `{value}`                        |
//! | 4 | object with `status` and `result`  | pass-through                              |
//! | 5 | object with `status` only          | remaining fields become `result`          |
//! | 6 | object with `result` only          | success, pass-through                     |
//! | 7 | object with string `message`       | success, `{text: message}`                |
//! | 8 | object with `response`             | classify the nested value                 |
//! | 9 | anything else                      | success, value as `result`                |
//!
//! The order is the contract. Rules never look at fields beyond the ones
//! listed above.

use serde_json::{Map, Value};

use crate::envelope::{EnvelopeStatus, NormalizedEnvelope};
use crate::error::messages;

/// Maximum number of nested `response` wrappers unwrapped before the current
/// object is taken verbatim.
pub const MAX_UNWRAP_DEPTH: usize = 8;

type Rule = fn(&Value, usize) -> Option<NormalizedEnvelope>;

const CASCADE: &[(&str, Rule)] = &[
    ("empty", empty_reply),
    ("text", bare_text),
    ("primitive", primitive),
    ("status_and_result", status_and_result),
    ("status_only", status_only),
    ("result_only", result_only),
    ("message_text", message_text),
    ("nested_response", nested_response),
];

/// Normalize a decoded reply. Total: every JSON value yields an envelope.
pub fn normalize(value: &Value) -> NormalizedEnvelope {
    normalize_with_rule(value).0
}

/// Like [`normalize`], also returning the name of the top-level rule that
/// matched (useful for logging).
pub fn normalize_with_rule(value: &Value) -> (NormalizedEnvelope, &'static str) {
    classify(value, 0)
}

fn classify(value: &Value, depth: usize) -> (NormalizedEnvelope, &'static str) {
    for &(name, rule) in CASCADE {
        if let Some(envelope) = rule(value, depth) {
            return (envelope, name);
        }
    }
    (fallback(value), "fallback")
}

fn empty_reply(value: &Value, _depth: usize) -> Option<NormalizedEnvelope> {
    is_falsy(value).then(|| NormalizedEnvelope::error(messages::EMPTY_RESPONSE))
}

fn bare_text(value: &Value, _depth: usize) -> Option<NormalizedEnvelope> {
    let text = value.as_str()?;
    Some(
        NormalizedEnvelope::success(single("text", value.clone()))
            .with_message(Some(text.to_string())),
    )
}

fn primitive(value: &Value, _depth: usize) -> Option<NormalizedEnvelope> {
    let rendered = match value {
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    Some(
        NormalizedEnvelope::success(single("value", value.clone())).with_message(Some(rendered)),
    )
}

fn status_and_result(value: &Value, _depth: usize) -> Option<NormalizedEnvelope> {
    let object = value.as_object()?;
    if !(object.contains_key("status") && object.contains_key("result")) {
        return None;
    }
    Some(
        NormalizedEnvelope {
            status: EnvelopeStatus::from_upstream(object.get("status")),
            result: coerce_result(object.get("result")),
            message: None,
            metadata: None,
        }
        .with_message(coerce_message(object.get("message")))
        .with_metadata(coerce_metadata(object.get("metadata"))),
    )
}

fn status_only(value: &Value, _depth: usize) -> Option<NormalizedEnvelope> {
    let object = value.as_object()?;
    if !object.contains_key("status") {
        return None;
    }
    let rest: Map<String, Value> = object
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "status" | "message" | "metadata"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Some(
        NormalizedEnvelope {
            status: EnvelopeStatus::from_upstream(object.get("status")),
            result: rest,
            message: None,
            metadata: None,
        }
        .with_message(coerce_message(object.get("message")))
        .with_metadata(coerce_metadata(object.get("metadata"))),
    )
}

fn result_only(value: &Value, _depth: usize) -> Option<NormalizedEnvelope> {
    let object = value.as_object()?;
    let result = object.get("result")?;
    Some(
        NormalizedEnvelope::success(coerce_result(Some(result)))
            .with_message(coerce_message(object.get("message")))
            .with_metadata(coerce_metadata(object.get("metadata"))),
    )
}

fn message_text(value: &Value, _depth: usize) -> Option<NormalizedEnvelope> {
    let message = value.as_object()?.get("message")?;
    let text = message.as_str()?;
    Some(
        NormalizedEnvelope::success(single("text", message.clone()))
            .with_message(Some(text.to_string())),
    )
}

fn nested_response(value: &Value, depth: usize) -> Option<NormalizedEnvelope> {
    let inner = value.as_object()?.get("response")?;
    if depth >= MAX_UNWRAP_DEPTH {
        return None;
    }
    Some(classify(inner, depth + 1).0)
}

fn fallback(value: &Value) -> NormalizedEnvelope {
    let result = match value {
        Value::Object(object) => object.clone(),
        Value::Array(_) => single("items", value.clone()),
        other => single("value", other.clone()),
    };
    NormalizedEnvelope::success(result)
}

fn single(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    map
}

/// `null`, `false`, zero and `""`. Arrays and objects are never falsy.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

/// Keep object results, default falsy ones to `{}` and wrap anything else.
fn coerce_result(value: Option<&Value>) -> Map<String, Value> {
    match value {
        None => Map::new(),
        Some(v) if is_falsy(v) => Map::new(),
        Some(Value::Object(object)) => object.clone(),
        Some(v @ Value::String(_)) => single("text", v.clone()),
        Some(v) => single("value", v.clone()),
    }
}

fn coerce_message(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn coerce_metadata(value: Option<&Value>) -> Option<Map<String, Value>> {
    value?.as_object().cloned()
}
