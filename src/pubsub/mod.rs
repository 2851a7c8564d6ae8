//! Pub/sub fabric: hubs keyed by group name, sessions with glob
//! subscriptions and bounded delivery queues, concurrent fan-out.

mod hub;
mod pool;
mod protocol;
mod session;
mod subscription;

pub use hub::{Hub, HubOptions};
pub use pool::HubPool;
pub use protocol::{Base64Bytes, ChannelList, Delivery, Request, Response};
pub use session::{Frame, Session, DEFAULT_QUEUE_SIZE};
pub use subscription::Subscription;

/// A published message: one or more channel names and an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channels: Vec<String>,
    pub body: Vec<u8>,
}
