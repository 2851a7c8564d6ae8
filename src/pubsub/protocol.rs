//! WebSocket wire protocol for pub/sub endpoints.
//!
//! Clients send a [`Request`] with exactly one populated field; the server
//! answers with a [`Response`] and pushes [`Delivery`] frames for matched
//! publishes. Payloads are base64 on the wire; channels accept a single
//! string or an array.

use std::sync::Arc;

use base64::prelude::{Engine, BASE64_STANDARD};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{AppError, AppResult};

use super::session::{Frame, Session};
use super::PubSubMessage;

/// Channel name(s): accepts `"a"` as well as `["a", "b"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelList(pub Vec<String>);

impl<'de> Deserialize<'de> for ChannelList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(single) => ChannelList(vec![single]),
            OneOrMany::Many(many) => ChannelList(many),
        })
    }
}

impl Serialize for ChannelList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

/// Binary payload carried as base64 text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Base64Bytes(pub Vec<u8>);

impl<'de> Deserialize<'de> for Base64Bytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = BASE64_STANDARD
            .decode(encoded.as_bytes())
            .map_err(D::Error::custom)?;
        Ok(Base64Bytes(bytes))
    }
}

impl Serialize for Base64Bytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(&self.0))
    }
}

/// Client request envelope: exactly one field should be set; the first
/// populated field wins.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub publish: Option<RequestPublish>,
    #[serde(default)]
    pub subscribe: Option<RequestSubscribe>,
    #[serde(default)]
    pub unsubscribe: Option<RequestUnsubscribe>,
    #[serde(default)]
    pub subscriptions: Option<RequestSubscriptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestPublish {
    pub channel: ChannelList,
    pub message: Base64Bytes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestSubscribe {
    #[serde(default)]
    pub channel: ChannelList,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestUnsubscribe {
    #[serde(default)]
    pub channel: ChannelList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestSubscriptions {}

impl Request {
    /// Dispatch to the session operation for the first populated field.
    /// Operation failures are folded into the response envelope's `error`.
    pub async fn execute(&self, session: &Arc<Session>) -> AppResult<Response> {
        if let Some(publish) = &self.publish {
            let result = session.publish(PubSubMessage {
                channels: publish.channel.0.clone(),
                body: publish.message.0.clone(),
            });
            return Ok(Response::simple(result.err()));
        }

        if let Some(subscribe) = &self.subscribe {
            let result = session.subscribe(&subscribe.channel.0).await;
            return Ok(Response::simple(result.err()));
        }

        if let Some(unsubscribe) = &self.unsubscribe {
            let result = session.unsubscribe(&unsubscribe.channel.0).await;
            return Ok(Response::simple(result.err()));
        }

        if self.subscriptions.is_some() {
            return Ok(Response::subscriptions(session.subscriptions().await));
        }

        Err(AppError::PubSubInvalidRequest)
    }
}

/// Server response envelope.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simple: Option<ResponseSimple>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriptions: Option<ResponseSubscriptions>,
}

impl Response {
    pub fn simple(error: Option<AppError>) -> Self {
        Response {
            simple: Some(ResponseSimple {
                error: error.map(|e| e.to_string()),
            }),
            subscriptions: None,
        }
    }

    pub fn subscriptions(channels: Vec<String>) -> Self {
        Response {
            simple: None,
            subscriptions: Some(ResponseSubscriptions {
                channels,
                error: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseSimple {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResponseSubscriptions {
    pub channels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server-to-client delivery frame: the matched subscription name and the
/// payload.
#[derive(Debug, Clone, Serialize)]
pub struct Delivery {
    pub channel: String,
    pub message: Base64Bytes,
}

impl From<Frame> for Delivery {
    fn from(frame: Frame) -> Self {
        Delivery {
            channel: frame.subscription,
            message: Base64Bytes(frame.message.body),
        }
    }
}
