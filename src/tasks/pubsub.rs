//! Pub/sub task: upgrade to WebSocket and bridge the client to a hub
//! session.

use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::AppResult;
use crate::pubsub::{Delivery, HubOptions, HubPool, Request, Session, DEFAULT_QUEUE_SIZE};
use crate::response::Envelope;
use crate::template;

use super::{FactoryContext, Task, TaskOutput, TaskRequest};

#[derive(Debug, Clone, Deserialize)]
pub struct PubSubTaskConfig {
    /// Hub group template; an empty render makes the endpoint
    /// per-connection instead of shared.
    #[serde(default)]
    pub group: String,

    /// Read deadline in seconds; expiry just re-arms the read loop.
    #[serde(default = "PubSubTaskConfig::default_retry")]
    pub websocket_retry_duration: u64,

    #[serde(default = "PubSubTaskConfig::default_queue_size")]
    pub max_queue_size: usize,
}

impl PubSubTaskConfig {
    const fn default_retry() -> u64 {
        10
    }

    const fn default_queue_size() -> usize {
        DEFAULT_QUEUE_SIZE
    }
}

pub struct PubSubTask {
    config: PubSubTaskConfig,
    pool: Arc<HubPool>,
}

pub fn factory(
    ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let config: PubSubTaskConfig = serde_json::from_value(tc.config.clone())?;
    template::verify(&config.group)?;

    Ok(vec![Box::new(PubSubTask {
        config,
        pool: Arc::clone(ctx.pool),
    })])
}

#[async_trait]
impl Task for PubSubTask {
    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        let group = match template::render(&self.config.group, &req.vars) {
            Ok(group) => group.trim().to_string(),
            Err(e) => return TaskOutput::Envelope(Envelope::ok().error(e)),
        };

        // no group means a private, per-connection hub
        let group = if group.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            group
        };

        let Some(upgrade) = req.take_upgrade() else {
            return TaskOutput::Envelope(
                Envelope::new(400).error("pubsub endpoint requires a websocket connection"),
            );
        };

        let options = HubOptions {
            max_queue_size: self.config.max_queue_size,
        };
        let (hub, created) = self.pool.get(&group, || options).await;
        if created {
            debug!(group = %group, "created new pubsub hub");
        }

        let session = hub.new_session().await;

        let retry = Duration::from_secs(self.config.websocket_retry_duration.max(1));
        TaskOutput::Response(
            upgrade.on_upgrade(move |socket| handle_socket(socket, session, retry)),
        )
    }
}

async fn handle_socket(socket: WebSocket, session: Arc<Session>, retry: Duration) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = session.recv() => {
                match frame {
                    Ok(frame) => {
                        if write_json(&mut sender, &Delivery::from(frame)).await.is_err() {
                            break;
                        }
                    }
                    // session closed underneath us
                    Err(_) => break,
                }
            }
            incoming = tokio::time::timeout(retry, receiver.next()) => {
                match incoming {
                    // deadline expired, re-arm the read
                    Err(_) => continue,
                    // connection is gone
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        warn!(session = %session.id(), error = %e, "error reading from websocket");
                        continue;
                    }
                    Ok(Some(Ok(Message::Close(_)))) => break,
                    Ok(Some(Ok(Message::Text(text)))) => {
                        let request: Request = match serde_json::from_str(&text) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!(session = %session.id(), error = %e, "invalid pubsub request");
                                continue;
                            }
                        };

                        let response = match request.execute(&session).await {
                            Ok(response) => response,
                            Err(e) => {
                                warn!(session = %session.id(), error = %e, "error running request");
                                continue;
                            }
                        };

                        if write_json(&mut sender, &response).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(Ok(_))) => {}
                }
            }
        }
    }

    session.close().await;
    debug!(session = %session.id(), "websocket detached");
}

async fn write_json<T: serde::Serialize>(
    sender: &mut SplitSink<WebSocket, Message>,
    value: &T,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied_from_empty_config() {
        let config: PubSubTaskConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.group, "");
        assert_eq!(config.websocket_retry_duration, 10);
        assert_eq!(config.max_queue_size, DEFAULT_QUEUE_SIZE);
    }

    #[test]
    fn config_overrides() {
        let config: PubSubTaskConfig = serde_json::from_value(serde_json::json!({
            "group": "chat.{{ url.room }}",
            "websocket_retry_duration": 3,
            "max_queue_size": 4
        }))
        .unwrap();
        assert_eq!(config.group, "chat.{{ url.room }}");
        assert_eq!(config.websocket_retry_duration, 3);
        assert_eq!(config.max_queue_size, 4);
    }
}
