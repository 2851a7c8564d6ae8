//! A broadcast domain: the set of live sessions for one group.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::error;

use crate::error::AppResult;

use super::session::{Session, DEFAULT_QUEUE_SIZE};
use super::PubSubMessage;

#[derive(Debug, Clone, Copy)]
pub struct HubOptions {
    /// Per-session delivery queue capacity; publishes into a full queue
    /// are dropped.
    pub max_queue_size: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        HubOptions {
            max_queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

pub struct Hub {
    group: String,
    options: HubOptions,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl Hub {
    pub fn new(group: &str, options: HubOptions) -> Arc<Self> {
        Arc::new(Hub {
            group: group.to_string(),
            options,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Create an empty session and register it with the hub.
    pub async fn new_session(self: &Arc<Self>) -> Arc<Session> {
        let session = Session::new(Arc::downgrade(self), self.options.max_queue_size);
        self.sessions
            .write()
            .await
            .insert(session.id().to_string(), Arc::clone(&session));
        session
    }

    /// Shortcut: create a session already subscribed to the channels.
    pub async fn subscribe(self: &Arc<Self>, channels: &[String]) -> AppResult<Arc<Session>> {
        let session = self.new_session().await;
        session.subscribe(channels).await?;
        Ok(session)
    }

    /// Fan a message out to every registered session, one best-effort task
    /// per session. Sessions closing concurrently are tolerated.
    pub async fn publish(&self, message: &PubSubMessage) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();

        for session in sessions {
            if let Err(e) = session.publish(message.clone()) {
                // closed concurrently; log and move on
                error!(group = %self.group, session = %session.id(), error = %e, "publish error");
            }
        }
    }

    /// Look a session up by id.
    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Unlink a session from the hub; called from `Session::close`.
    pub async fn close_session(&self, id: &str) {
        self.sessions.write().await.remove(id);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: &str, body: &[u8]) -> PubSubMessage {
        PubSubMessage {
            channels: vec![channel.to_string()],
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn session_reachable_until_closed() {
        let hub = Hub::new("g", HubOptions::default());
        let session = hub.new_session().await;
        assert!(hub.session(session.id()).await.is_some());

        session.close().await;
        assert!(hub.session(session.id()).await.is_none());
        assert_eq!(hub.session_count().await, 0);
    }

    #[tokio::test]
    async fn publish_fans_out_to_matching_sessions() {
        let hub = Hub::new("g", HubOptions::default());
        let a = hub.subscribe(&["room.*".to_string()]).await.unwrap();
        let b = hub.subscribe(&["other".to_string()]).await.unwrap();

        hub.publish(&message("room.7", b"hi")).await;

        let frame = a.recv().await.unwrap();
        assert_eq!(frame.subscription, "room.*");
        assert_eq!(frame.message.body, b"hi");

        let nothing = tokio::time::timeout(std::time::Duration::from_millis(50), b.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn publish_tolerates_concurrent_close() {
        let hub = Hub::new("g", HubOptions::default());
        let doomed = hub.subscribe(&["c".to_string()]).await.unwrap();
        let stable = hub.subscribe(&["c".to_string()]).await.unwrap();

        let closer = {
            let doomed = Arc::clone(&doomed);
            tokio::spawn(async move { doomed.close().await })
        };
        hub.publish(&message("c", b"x")).await;
        closer.await.unwrap();

        // the surviving session still gets the message
        let frame = stable.recv().await.unwrap();
        assert_eq!(frame.message.body, b"x");
    }
}
