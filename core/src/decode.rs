//! Tolerant decoding of upstream reply text.
//!
//! Agents do not always answer with clean JSON: replies arrive wrapped in
//! markdown fences, embedded in prose, or with raw newlines inside string
//! literals. [`decode`] tries progressively looser readings and reports a
//! [`DecodeFailure`] instead of panicking when nothing parses.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::error::messages;

static CLOSING_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*```[ \t]*$").expect("valid regex"));

/// Typed failure marker: the text could not be read as structured data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error}")]
pub struct DecodeFailure {
    pub error: String,
}

impl DecodeFailure {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }

    /// Recognize a `{"success": false, ...}` marker in an already decoded value.
    ///
    /// Upstream agents use the same shape to report their own failures, so a
    /// decoded reply can carry a marker even when decoding itself succeeded.
    pub fn from_marker(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if object.get("success") != Some(&Value::Bool(false)) {
            return None;
        }
        let error = object
            .get("error")
            .and_then(Value::as_str)
            .filter(|error| !error.is_empty())
            .unwrap_or(messages::PARSE_FAILED);
        Some(Self::new(error))
    }

    /// Wire form of the marker, `{"success": false, "error": ...}`.
    pub fn to_marker(&self) -> Value {
        json!({ "success": false, "error": self.error })
    }
}

/// Decode raw reply text into a JSON value.
///
/// Attempts, in order: the whole text, fenced code blocks, then balanced
/// `{...}`/`[...]` structures found in surrounding prose. Each candidate is
/// retried once with raw newlines inside strings escaped.
pub fn decode(raw: &str) -> Result<Value, DecodeFailure> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DecodeFailure::new("Empty response"));
    }

    let first_error = match parse_candidate(trimmed) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    for block in extract_fenced_blocks(trimmed) {
        if let Ok(value) = parse_candidate(block.trim()) {
            return Ok(value);
        }
    }

    for candidate in extract_balanced_structures(trimmed) {
        if let Ok(value) = parse_candidate(candidate) {
            return Ok(value);
        }
    }

    Err(DecodeFailure::new(format!(
        "Failed to parse JSON: {first_error}"
    )))
}

/// Decoder output in the wire convention: the value itself, or the marker.
pub fn decode_or_marker(raw: &str) -> Value {
    decode(raw).unwrap_or_else(|failure| failure.to_marker())
}

fn parse_candidate(text: &str) -> Result<Value, serde_json::Error> {
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(err) => {
            let repaired = escape_raw_newlines_in_strings(text);
            if repaired == text {
                return Err(err);
            }
            serde_json::from_str(&repaired).map_err(|_| err)
        }
    }
}

/// Bodies of ```` ``` ```` fences tagged `json` or untagged.
///
/// A fence closes only on a line holding nothing but ```` ``` ````, so
/// backticks inside string values do not cut a block short.
fn extract_fenced_blocks(content: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut search_from = 0usize;

    while let Some(rel_start) = content[search_from..].find("```") {
        let after_ticks = search_from + rel_start + 3;
        let Some(rel_nl) = content[after_ticks..].find('\n') else {
            break;
        };
        let tag = content[after_ticks..after_ticks + rel_nl].trim();
        let body_start = after_ticks + rel_nl + 1;

        let Some(end) = CLOSING_FENCE.find(&content[body_start..]) else {
            break;
        };
        if tag.is_empty() || tag.eq_ignore_ascii_case("json") {
            blocks.push(&content[body_start..body_start + end.start()]);
        }
        search_from = body_start + end.end();
    }

    blocks
}

/// Top-level `{...}` or `[...]` spans, balanced outside of string literals.
fn extract_balanced_structures(content: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    let mut depth: usize = 0;
    let mut start: Option<usize> = None;

    for (i, ch) in content.char_indices() {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' if depth > 0 => in_string = true,
            '{' | '[' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' | ']' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        out.push(&content[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    out
}

/// Escape literal `\n`/`\r` that appear inside JSON string literals.
fn escape_raw_newlines_in_strings(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escape = false;

    for ch in input.chars() {
        if in_string {
            if escape {
                out.push(ch);
                escape = false;
                continue;
            }
            match ch {
                '\\' => {
                    out.push(ch);
                    escape = true;
                }
                '"' => {
                    out.push(ch);
                    in_string = false;
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                _ => out.push(ch),
            }
        } else {
            out.push(ch);
            if ch == '"' {
                in_string = true;
            }
        }
    }

    out
}
