//! One client's view of a hub: a subscription set and a bounded delivery
//! queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::hub::Hub;
use super::subscription::Subscription;
use super::PubSubMessage;

pub const DEFAULT_QUEUE_SIZE: usize = 32;

/// A delivered message together with the subscription that matched it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub subscription: String,
    pub message: PubSubMessage,
}

pub struct Session {
    id: String,
    // locked independently of the hub's session map; the two locks are
    // never held at the same time
    subscriptions: RwLock<HashMap<String, Subscription>>,
    tx: mpsc::Sender<Frame>,
    rx: Mutex<mpsc::Receiver<Frame>>,
    closed: AtomicBool,
    close_signal: Notify,
    hub: Weak<Hub>,
}

impl Session {
    pub(super) fn new(hub: Weak<Hub>, queue_size: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        Arc::new(Session {
            id: Uuid::new_v4().to_string(),
            subscriptions: RwLock::new(HashMap::new()),
            tx,
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            hub,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Compile and install subscriptions; re-subscribing a name replaces
    /// the previous entry. All globs are compiled before any is installed.
    pub async fn subscribe(&self, channels: &[String]) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::PubSubClosed);
        }

        let parsed = channels
            .iter()
            .map(|channel| Subscription::parse(channel))
            .collect::<AppResult<Vec<_>>>()?;

        let mut subscriptions = self.subscriptions.write().await;
        for subscription in parsed {
            subscriptions.insert(subscription.name().to_string(), subscription);
        }

        Ok(())
    }

    /// Remove subscriptions by their original glob string.
    pub async fn unsubscribe(&self, channels: &[String]) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::PubSubClosed);
        }

        let mut subscriptions = self.subscriptions.write().await;
        for channel in channels {
            subscriptions.remove(channel);
        }

        Ok(())
    }

    /// Snapshot of subscribed glob strings.
    pub async fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.read().await.keys().cloned().collect()
    }

    /// First subscription whose pattern matches the channel. Iteration
    /// order over the subscription map is unspecified, so which of several
    /// matching subscriptions wins is deliberately non-deterministic.
    pub async fn matches(&self, channel: &str) -> Option<String> {
        let subscriptions = self.subscriptions.read().await;
        subscriptions
            .values()
            .find(|subscription| subscription.matches(channel))
            .map(|subscription| subscription.name().to_string())
    }

    /// Best-effort delivery: spawn a task that enqueues at most one frame
    /// for the first matching channel. A full queue drops the message with
    /// a warning; publish never blocks on a slow consumer.
    pub fn publish(self: &Arc<Self>, message: PubSubMessage) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::PubSubClosed);
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            for channel in &message.channels {
                let Some(matched) = session.matches(channel).await else {
                    continue;
                };

                debug!(channel = %channel, subscriber = %matched, "publishing message");

                let frame = Frame {
                    subscription: matched.clone(),
                    message: message.clone(),
                };
                match session.tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            channel = %channel,
                            subscriber = %matched,
                            capacity = session.tx.max_capacity(),
                            "delivery queue full, dropping message"
                        );
                    }
                    // session closed concurrently; nothing to deliver to
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
                return;
            }
        });

        Ok(())
    }

    /// Wait for the next frame. Returns [`AppError::PubSubClosed`] once the
    /// session has been closed.
    pub async fn recv(&self) -> AppResult<Frame> {
        if self.is_closed() {
            return Err(AppError::PubSubClosed);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.close_signal.notified() => Err(AppError::PubSubClosed),
            frame = rx.recv() => frame.ok_or(AppError::PubSubClosed),
        }
    }

    /// Close the session: mark closed, signal waiting receivers, drain and
    /// close the delivery queue, detach from the owning hub. Idempotent;
    /// the queue is closed exactly once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // flag write happens-before the signal; notify_one stores a permit
        // so a receiver that registers late still wakes
        self.close_signal.notify_one();

        let mut rx = self.rx.lock().await;
        rx.close();
        while rx.try_recv().is_ok() {}
        drop(rx);

        if let Some(hub) = self.hub.upgrade() {
            hub.close_session(&self.id).await;
        }
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

    fn session(queue: usize) -> Arc<Session> {
        Session::new(Weak::new(), queue)
    }

    #[tokio::test]
    async fn subscribe_twice_keeps_one_entry() {
        let s = session(4);
        s.subscribe(&["a.*".to_string()]).await.unwrap();
        s.subscribe(&["a.*".to_string()]).await.unwrap();
        assert_eq!(s.subscriptions().await, vec!["a.*".to_string()]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_by_name() {
        let s = session(4);
        s.subscribe(&["a".to_string(), "b".to_string()]).await.unwrap();
        s.unsubscribe(&["a".to_string()]).await.unwrap();
        assert_eq!(s.subscriptions().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn publish_delivers_first_match() {
        let s = session(4);
        s.subscribe(&["room.*".to_string()]).await.unwrap();
        s.publish(message("room.1", b"hello")).unwrap();

        let frame = s.recv().await.unwrap();
        assert_eq!(frame.subscription, "room.*");
        assert_eq!(frame.message.body, b"hello");
    }

    #[tokio::test]
    async fn publish_without_match_is_dropped() {
        let s = session(4);
        s.subscribe(&["room.*".to_string()]).await.unwrap();
        s.publish(message("lobby", b"x")).unwrap();
        s.publish(message("room.2", b"y")).unwrap();

        // only the matching publish is delivered
        let frame = s.recv().await.unwrap();
        assert_eq!(frame.message.body, b"y");
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let s = session(1);
        s.subscribe(&["c".to_string()]).await.unwrap();

        for i in 0..8u8 {
            s.publish(message("c", &[i])).unwrap();
        }
        // wait for the spawned delivery tasks to settle
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // exactly one frame fits the queue; the rest were dropped
        let first = s.recv().await.unwrap();
        assert_eq!(first.message.channels, vec!["c".to_string()]);

        let empty = tokio::time::timeout(std::time::Duration::from_millis(50), s.recv()).await;
        assert!(empty.is_err(), "queue should be empty after drops");
    }

    #[tokio::test]
    async fn recv_after_close_is_closed_error() {
        let s = session(4);
        s.close().await;
        assert!(matches!(s.recv().await, Err(AppError::PubSubClosed)));
        assert!(matches!(
            s.subscribe(&["a".to_string()]).await,
            Err(AppError::PubSubClosed)
        ));
        assert!(matches!(
            s.publish(message("a", b"x")),
            Err(AppError::PubSubClosed)
        ));
    }

    #[tokio::test]
    async fn close_wakes_blocked_receiver() {
        let s = session(4);
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.recv().await })
        };
        tokio::task::yield_now().await;
        s.close().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(AppError::PubSubClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let s = session(4);
        s.close().await;
        s.close().await;
        assert!(s.is_closed());
    }
}
