//! Process-wide pool of hubs keyed by group name. Hubs are created lazily
//! and live until process exit.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::hub::{Hub, HubOptions};

#[derive(Default)]
pub struct HubPool {
    hubs: RwLock<HashMap<String, Arc<Hub>>>,
}

impl HubPool {
    pub fn new() -> Self {
        HubPool::default()
    }

    /// Get the hub for a group, constructing it when absent. The options
    /// supplier is invoked only on construction. Two concurrent callers
    /// may both construct; the last writer wins and the orphan is dropped
    /// (hubs hold no external resources at construction time).
    pub async fn get<F>(&self, group: &str, options: F) -> (Arc<Hub>, bool)
    where
        F: FnOnce() -> HubOptions,
    {
        {
            let hubs = self.hubs.read().await;
            if let Some(hub) = hubs.get(group) {
                return (Arc::clone(hub), false);
            }
        }

        let hub = Hub::new(group, options());
        self.hubs
            .write()
            .await
            .insert(group.to_string(), Arc::clone(&hub));
        (hub, true)
    }

    /// Drop a hub from the pool.
    pub async fn close(&self, group: &str) {
        self.hubs.write().await.remove(group);
    }

    pub async fn len(&self) -> usize {
        self.hubs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hubs.read().await.is_empty()
    }
}
