//! Task registry and the task contract every handler implementation
//! satisfies.

mod cassandra;
mod email;
mod filesystem;
mod http;
mod info;
mod multi;
mod mysql;
mod postgres;
mod pubsub;
mod redis;
mod shell;

pub use info::RouteDescriptor;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::async_trait;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use serde_json::Value;

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::pubsub::HubPool;
use crate::requester::Requester;
use crate::response::Envelope;

/// Everything a task sees about the incoming request: the rendered
/// variable bundle plus the pieces some tasks consume directly.
pub struct TaskRequest {
    pub method: String,
    pub body: String,
    /// Template variable bundle: `url`, `query`, `request`, `env`.
    pub vars: Value,
    /// Present when the request is a WebSocket upgrade; the pubsub task
    /// takes it.
    upgrade: Mutex<Option<WebSocketUpgrade>>,
}

impl TaskRequest {
    pub fn new(method: String, body: String, vars: Value, upgrade: Option<WebSocketUpgrade>) -> Self {
        TaskRequest {
            method,
            body,
            vars,
            upgrade: Mutex::new(upgrade),
        }
    }

    /// Take the WebSocket upgrade, if any; it can be consumed only once.
    pub fn take_upgrade(&self) -> Option<WebSocketUpgrade> {
        self.upgrade.lock().ok().and_then(|mut guard| guard.take())
    }
}

/// What a task run produces: a composable envelope, or a full HTTP
/// response when the task takes over the connection (WebSocket upgrade).
pub enum TaskOutput {
    Envelope(Envelope),
    Response(Response),
}

impl From<Envelope> for TaskOutput {
    fn from(envelope: Envelope) -> Self {
        TaskOutput::Envelope(envelope)
    }
}

/// A task instance bound to one route.
#[async_trait]
pub trait Task: Send + Sync {
    /// Appended to the endpoint path when the route is registered.
    fn path_suffix(&self) -> &str {
        ""
    }

    async fn run(&self, req: &TaskRequest) -> TaskOutput;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<task>")
    }
}

/// Context handed to task factories at route-building time.
pub struct FactoryContext<'a> {
    pub version: &'a str,
    pub registry: &'a TaskRegistry,
    pub pool: &'a Arc<HubPool>,
    pub requester: &'a Requester,
    /// Descriptors of every configured route, for introspection.
    pub routes: &'a [RouteDescriptor],
    /// Raw config file bytes, for introspection echo.
    pub raw_config: &'a [u8],
}

/// Builds task instances from a raw config blob. One config may expand
/// into several instances (several routes).
pub type TaskFactory =
    fn(&FactoryContext, &TaskConfig, &EndpointConfig) -> AppResult<Vec<Box<dyn Task>>>;

/// Name -> factory table, filled at startup.
pub struct TaskRegistry {
    factories: HashMap<String, TaskFactory>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registry with all built-in tasks.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("cassandra", cassandra::factory);
        registry.register("email", email::factory);
        registry.register("filesystem", filesystem::factory);
        registry.register("http", http::factory);
        registry.register("info", info::factory);
        registry.register("multi", multi::factory);
        registry.register("mysql", mysql::factory);
        registry.register("postgres", postgres::factory);
        registry.register("pubsub", pubsub::factory);
        registry.register("redis", redis::factory);
        registry.register("shell", shell::factory);
        registry
    }

    /// Register a factory. Panics when the name is already taken.
    pub fn register(&mut self, name: &str, factory: TaskFactory) {
        if self.factories.contains_key(name) {
            panic!("task factory {} already registered", name);
        }
        self.factories.insert(name.to_string(), factory);
    }

    pub fn lookup(&self, name: &str) -> Option<TaskFactory> {
        self.factories.get(name).copied()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Validate a `single_result` index against the number of sub-results.
pub(crate) fn single_result_index(
    single_result: Option<usize>,
    len: usize,
    what: &str,
) -> AppResult<Option<usize>> {
    match single_result {
        Some(index) if index >= len => Err(AppError::Config(format!(
            "{} single_result out of bounds",
            what
        ))),
        other => Ok(other),
    }
}

/// Compose sub-results into the outer envelope, honoring `single_result`.
pub(crate) fn compose(results: Vec<Envelope>, single_result: Option<usize>) -> Envelope {
    match single_result {
        Some(index) if index < results.len() => Envelope::ok().result(&results[index]),
        _ => Envelope::ok().result(results),
    }
}
