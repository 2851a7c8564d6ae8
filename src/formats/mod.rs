//! Output format parsing: `|`-separated format specs with a `text` fallback.
//!
//! A spec such as `"json|lines"` is tried left to right; the first format
//! that parses the body wins and its name is reported. `text` always
//! succeeds and is implicitly appended to every spec that lacks it.

use serde_json::Value;

use crate::error::{AppError, AppResult};

const DELIMITER: char = '|';

/// Known format names, in registration order.
pub const FORMATS: [&str; 4] = ["json", "jsonlines", "lines", "text"];

fn known(name: &str) -> bool {
    FORMATS.contains(&name)
}

/// Validate a format spec and append the implicit `text` fallback.
/// Empty parts are skipped, unknown names are an error.
pub fn verify(spec: &str) -> AppResult<String> {
    let mut parts: Vec<&str> = Vec::new();
    let mut found_text = false;

    for part in spec.split(DELIMITER) {
        if part.is_empty() {
            continue;
        }
        if !known(part) {
            return Err(AppError::UnknownFormat(part.to_string()));
        }
        parts.push(part);
        if part == "text" {
            found_text = true;
        }
    }

    if !found_text {
        parts.push("text");
    }

    Ok(parts.join("|"))
}

/// Parse `body` through the spec; returns the parsed value and the name of
/// the format that accepted it.
pub fn format(body: &str, spec: &str) -> AppResult<(Value, String)> {
    let mut last = None;
    for part in spec.split(DELIMITER) {
        if !known(part) {
            return Err(AppError::UnknownFormat(part.to_string()));
        }
        match apply(body, part) {
            Ok(value) => return Ok((value, part.to_string())),
            Err(err) => last = Some(err),
        }
    }
    // only reachable for specs not passed through verify (no trailing text)
    Err(last.map(AppError::from).unwrap_or_else(|| AppError::UnknownFormat(spec.to_string())))
}

/// Whether the spec already contains the named format.
pub fn has(spec: &str, name: &str) -> bool {
    spec.split(DELIMITER).any(|part| part == name)
}

/// Prepend the named format to the spec; idempotent.
pub fn add(spec: &str, name: &str) -> String {
    if has(spec, name) {
        return spec.to_string();
    }
    if spec.is_empty() {
        name.to_string()
    } else {
        format!("{}{}{}", name, DELIMITER, spec)
    }
}

fn apply(body: &str, name: &str) -> Result<Value, serde_json::Error> {
    match name {
        "json" => serde_json::from_str::<Value>(body),
        "jsonlines" => body
            .split('\n')
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::from),
        "lines" => Ok(Value::from(
            body.split('\n').map(Value::from).collect::<Vec<_>>(),
        )),
        // "text" and anything the caller already validated
        _ => Ok(Value::from(body)),
    }
}
