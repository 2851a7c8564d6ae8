//! JSON response envelope: a chainable builder shared by every task.
//!
//! An envelope is a JSON object with reserved keys (`status`, `message`,
//! `error`, `result`, `format`, `result_size`) plus arbitrary user keys.
//! Alternatively it can carry a raw byte body or an HTML page, in which
//! case the JSON object is not written at all. Nested envelopes (sub-task
//! results) drop the redundant `status`/`message` pair via
//! [`Envelope::strip_status_data`].

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::prelude::{Engine, BASE64_STANDARD};
use serde::ser::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Canonical reason phrase for a status code, e.g. `200` -> `"OK"`.
fn reason(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[derive(Debug, Clone)]
enum AltBody {
    Raw(Vec<u8>),
    Html(String),
}

/// Chainable response envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    status: u16,
    pretty: bool,
    data: Map<String, Value>,
    alt: Option<AltBody>,
}

impl Envelope {
    /// New envelope with `status` and `message` keys set.
    pub fn new(status: u16) -> Self {
        Envelope {
            status: 200,
            pretty: false,
            data: Map::new(),
            alt: None,
        }
        .status(status)
    }

    /// Shorthand for `Envelope::new(200)`.
    pub fn ok() -> Self {
        Envelope::new(200)
    }

    /// Set the HTTP status and refresh the `status`/`message` keys.
    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self.data.insert("status".into(), Value::from(status));
        self.data.insert("message".into(), Value::from(reason(status)));
        self
    }

    pub fn get_status(&self) -> u16 {
        self.status
    }

    /// Pretty-print the JSON body on write.
    pub fn pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    /// Shorthand for `data("result", value)`.
    pub fn result<T: serde::Serialize>(self, value: T) -> Self {
        self.data("result", value)
    }

    /// Set `result` and `result_size` from a list of values.
    pub fn slice_result<T: serde::Serialize>(self, values: Vec<T>) -> Self {
        let size = values.len();
        self.data("result", values).data("result_size", size)
    }

    /// Shorthand for `data("error", ...)`; stores the display string.
    pub fn error<E: std::fmt::Display>(self, err: E) -> Self {
        self.data("error", err.to_string())
    }

    /// Set an arbitrary key on the envelope.
    pub fn data<T: serde::Serialize>(mut self, key: &str, value: T) -> Self {
        self.data.insert(key.to_string(), to_value(value));
        self
    }

    /// Remove a key from the envelope.
    pub fn delete(mut self, key: &str) -> Self {
        self.data.remove(key);
        self
    }

    /// Whether the envelope carries the key.
    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Read a key back from the envelope.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Replace the body with raw bytes, bypassing JSON serialization.
    pub fn raw<B: Into<Vec<u8>>>(mut self, body: B) -> Self {
        self.alt = Some(AltBody::Raw(body.into()));
        self
    }

    /// Replace the body with an HTML page.
    pub fn html<S: Into<String>>(mut self, body: S) -> Self {
        self.alt = Some(AltBody::Html(body.into()));
        self
    }

    /// Whether a raw or HTML body has been set.
    pub fn is_alt(&self) -> bool {
        self.alt.is_some()
    }

    /// Drop the `status`/`message` pair; used when the envelope is nested
    /// inside another one.
    pub fn strip_status_data(mut self) -> Self {
        self.data.remove("status");
        if self.data.get("message").and_then(Value::as_str) == Some(reason(self.status)) {
            self.data.remove("message");
        }
        self
    }

    /// Re-add the `status`/`message` pair after a strip.
    pub fn update_status_data(self) -> Self {
        let status = self.status;
        self.status(status)
    }

    /// Serialize the JSON body (compact or pretty).
    pub fn body_bytes(&self) -> Vec<u8> {
        let value = Value::Object(self.data.clone());
        let out = if self.pretty {
            serde_json::to_vec_pretty(&value)
        } else {
            serde_json::to_vec(&value)
        };
        out.unwrap_or_default()
    }

    /// Build the HTTP response: raw/html verbatim, JSON otherwise.
    pub fn write(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        match self.alt {
            Some(AltBody::Raw(bytes)) => (
                status,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                bytes,
            )
                .into_response(),
            Some(AltBody::Html(page)) => (
                status,
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                page,
            )
                .into_response(),
            None => {
                let body = self.body_bytes();
                (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
            }
        }
    }
}

impl Serialize for Envelope {
    /// Nested envelopes serialize as their JSON object; a nested raw body
    /// serializes as its base64 string.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.alt {
            Some(AltBody::Raw(bytes)) => serializer.serialize_str(&BASE64_STANDARD.encode(bytes)),
            Some(AltBody::Html(page)) => serializer.serialize_str(page),
            None => self.data.serialize(serializer),
        }
    }
}

impl IntoResponse for Envelope {
    fn into_response(self) -> Response {
        self.write()
    }
}
