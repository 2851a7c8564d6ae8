//! Server: materializes configured endpoints into routes and serves each
//! one with the request pipeline (recover, authorize, build variable
//! bundle, run task, write envelope).

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{FromRequestParts, Query, RawPathParams, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::response::Response;
use axum::routing::MethodFilter;
use axum::Router;
use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::auth::{AuthorizerRegistry, Authorizers};
use crate::config::{Config, EndpointConfig, QueryParams, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::pubsub::HubPool;
use crate::requester::Requester;
use crate::response::Envelope;
use crate::tasks::{
    FactoryContext, RouteDescriptor, Task, TaskOutput, TaskRegistry, TaskRequest,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A materialized (path, method, task) triple. Routes are built once at
/// startup and never change afterwards.
pub struct Route {
    pub endpoint: EndpointConfig,
    pub task_config: TaskConfig,
    pub method: String,
    pub path: String,
    /// Content hash of the endpoint path.
    pub name: String,
    pub task: Arc<dyn Task>,
}

pub struct Server {
    config: Config,
    authorizers: Authorizers,
    routes: Vec<Arc<Route>>,
    /// Environment snapshot taken at startup; per-request when
    /// `reload_env` is set.
    env: Value,
}

impl Server {
    /// Validate the config, build all authorizers and routes.
    pub fn new(mut config: Config) -> AppResult<Self> {
        config.validate()?;

        let authorizer_registry = AuthorizerRegistry::builtin();
        let authorizers = authorizer_registry.build_all(&config)?;

        let task_registry = TaskRegistry::builtin();
        let pool = Arc::new(HubPool::new());
        let requester = Requester::new()?;
        let descriptors = route_descriptors(&config);

        let ctx = FactoryContext {
            version: VERSION,
            registry: &task_registry,
            pool: &pool,
            requester: &requester,
            routes: &descriptors,
            raw_config: &config.raw,
        };

        let mut routes = Vec::new();
        for endpoint in &config.endpoints {
            for (method, task_config) in &endpoint.methods {
                let mut task_config = task_config.clone();
                task_config.validate().map_err(|e| {
                    AppError::Config(format!("endpoint {}: {}", endpoint.path, e))
                })?;

                let factory = task_registry.lookup(&task_config.kind).ok_or_else(|| {
                    AppError::Config(format!("task {} doesn't exist", task_config.kind))
                })?;

                let tasks = factory(&ctx, &task_config, endpoint).map_err(|e| {
                    AppError::Config(format!("task {} returned error: {}", task_config.kind, e))
                })?;

                for task in tasks {
                    let path = format!("{}{}", endpoint.path, task.path_suffix());
                    routes.push(Arc::new(Route {
                        endpoint: endpoint.clone(),
                        task_config: task_config.clone(),
                        method: method.to_ascii_uppercase(),
                        path,
                        name: endpoint.route_name(),
                        task: Arc::from(task),
                    }));
                }
            }
        }

        Ok(Server {
            config,
            authorizers,
            routes,
            env: env_bundle(),
        })
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Build the router with one handler per route.
    pub fn router(&self) -> AppResult<Router> {
        let mut method_routers: HashMap<String, axum::routing::MethodRouter> = HashMap::new();

        for route in &self.routes {
            debug!(path = %route.path, method = %route.method, task = %route.task_config.kind, "register route");

            let filter = method_filter(&route.method)?;
            let ctx = Arc::new(RouteContext {
                route: Arc::clone(route),
                authorizers: self.authorizers.clone(),
                pretty: self.config.pretty_json,
                reload_env: self.config.reload_env,
                env: self.env.clone(),
            });

            let handler = move |request: axum::extract::Request| {
                let ctx = Arc::clone(&ctx);
                async move { handle(ctx, request).await }
            };

            let axum_path = axum_path(&route.path);
            let entry = method_routers.remove(&axum_path).unwrap_or_default();
            method_routers.insert(axum_path, entry.on(filter, handler));
        }

        let mut router = Router::new();
        for (path, method_router) in method_routers {
            router = router.route(&path, method_router);
        }

        Ok(router
            .fallback(|| async { Envelope::new(404).write() })
            .layer(tower_http::trace::TraceLayer::new_for_http()))
    }

    /// Bind and serve; HTTPS when `ssl` is configured.
    pub async fn run(&self) -> AppResult<()> {
        let router = self.router()?;
        let listen = self.config.listen_addr();
        let addr: std::net::SocketAddr = listen
            .parse()
            .map_err(|e| AppError::Config(format!("invalid listen address {}: {}", listen, e)))?;

        if let Some(ssl) = &self.config.ssl {
            info!(address = %listen, "listening (https)");
            let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(&ssl.cert, &ssl.key)
                .await
                .map_err(|e| AppError::Config(format!("ssl: {}", e)))?;
            axum_server::bind_rustls(addr, tls)
                .serve(router.into_make_service())
                .await?;
        } else {
            info!(address = %listen, "listening (http)");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutting down");
}

struct RouteContext {
    route: Arc<Route>,
    authorizers: Authorizers,
    pretty: bool,
    reload_env: bool,
    env: Value,
}

/// Top of the pipeline: the panic guard.
async fn handle(ctx: Arc<RouteContext>, request: axum::extract::Request) -> Response {
    let pretty = ctx.pretty;
    match AssertUnwindSafe(run_pipeline(ctx, request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic);
            error!(error = %message, "handler panicked");
            Envelope::new(500).pretty(pretty).error(message).write()
        }
    }
}

async fn run_pipeline(ctx: Arc<RouteContext>, request: axum::extract::Request) -> Response {
    let (mut parts, body) = request.into_parts();

    // authorizer chain; failures carry no distinguishing detail
    if let Err(e) = ctx.authorizers.check(&parts, &ctx.route.endpoint).await {
        debug!(path = %ctx.route.path, error = %e, "authorization failed");
        return Envelope::new(401).pretty(ctx.pretty).write();
    }

    // only present for websocket requests
    let upgrade = WebSocketUpgrade::from_request_parts(&mut parts, &()).await.ok();

    let url_vars = path_vars(&mut parts).await;
    let query_vars = query_params(&parts, &ctx.route.endpoint);

    // body read is best effort; an unreadable body is just empty
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(_) => String::new(),
    };

    let mut request_data = Map::new();
    request_data.insert("method".to_string(), Value::from(parts.method.as_str()));
    request_data.insert("body".to_string(), Value::from(body.clone()));

    let content_type = parts
        .headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.starts_with("application/json") {
        if let Ok(json) = serde_json::from_str::<Value>(&body) {
            request_data.insert("json".to_string(), json);
        }
    }

    let mut vars = Map::new();
    vars.insert("url".to_string(), Value::from(serde_json::Map::from_iter(
        url_vars.into_iter().map(|(k, v)| (k, Value::from(v))),
    )));
    vars.insert("query".to_string(), Value::from(serde_json::Map::from_iter(
        query_vars.into_iter().map(|(k, v)| (k, Value::from(v))),
    )));
    vars.insert("request".to_string(), Value::Object(request_data));
    vars.insert(
        "env".to_string(),
        if ctx.reload_env { env_bundle() } else { ctx.env.clone() },
    );
    let vars = Value::Object(vars);

    let task_request = TaskRequest::new(parts.method.to_string(), body, vars.clone(), upgrade);

    let envelope = match ctx.route.task.run(&task_request).await {
        TaskOutput::Response(response) => return response,
        TaskOutput::Envelope(envelope) => envelope,
    };

    let mut envelope = envelope.pretty(ctx.pretty);
    envelope = return_params(envelope, &ctx.route, &vars);

    debug!(
        method = %parts.method,
        path = %parts.uri.path(),
        status = envelope.get_status(),
        "request"
    );

    if ctx.route.endpoint.raw_response && !envelope.is_alt() {
        return raw_result(envelope);
    }

    envelope.write()
}

/// Attach the variable bundle under `params` when a query-param spec asks
/// for it and the task did not already set one.
fn return_params(envelope: Envelope, route: &Route, vars: &Value) -> Envelope {
    let endpoint_wants = route
        .endpoint
        .query_params
        .as_ref()
        .map(|qp| qp.return_params)
        .unwrap_or(false);
    let method_wants = route
        .task_config
        .query_params
        .as_ref()
        .map(|qp| qp.return_params)
        .unwrap_or(false);

    if (endpoint_wants || method_wants) && !envelope.has("params") {
        return envelope.data("params", vars);
    }
    envelope
}

/// `raw_response` endpoints write the result verbatim: strings as bytes,
/// anything else as compact JSON.
fn raw_result(envelope: Envelope) -> Response {
    let body = match envelope.get("result") {
        Some(Value::String(text)) => text.clone().into_bytes(),
        Some(other) => serde_json::to_vec(other).unwrap_or_default(),
        None => Vec::new(),
    };
    let status = envelope.get_status();
    Envelope::new(status).raw(body).write()
}

async fn path_vars(parts: &mut Parts) -> HashMap<String, String> {
    match RawPathParams::from_request_parts(parts, &()).await {
        Ok(params) => params
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect(),
        Err(_) => HashMap::new(),
    }
}

/// Endpoint-level query-param spec wins; the method-level spec applies
/// otherwise.
fn query_params(parts: &Parts, endpoint: &EndpointConfig) -> HashMap<String, String> {
    let raw: HashMap<String, String> = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|query| query.0)
        .unwrap_or_default();

    let spec: Option<&QueryParams> = endpoint.query_params.as_ref().or_else(|| {
        endpoint
            .methods
            .get(parts.method.as_str())
            .and_then(|task| task.query_params.as_ref())
    });

    spec.map(|spec| spec.extract(&raw)).unwrap_or_default()
}

/// Route descriptors for introspection, computed straight from config.
fn route_descriptors(config: &Config) -> Vec<RouteDescriptor> {
    let mut descriptors = Vec::new();
    for endpoint in &config.endpoints {
        for (method, task) in &endpoint.methods {
            descriptors.push(RouteDescriptor {
                path: endpoint.path.clone(),
                method: method.to_ascii_uppercase(),
                kind: task.kind.clone(),
                description: task.description.clone(),
                authorizers: task.authorizers.clone(),
                name: endpoint.route_name(),
            });
        }
    }
    descriptors.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.method.cmp(&b.method)));
    descriptors
}

/// Convert `{var}` path placeholders to the router's `:var` captures.
fn axum_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.len() > 2 && segment.starts_with('{') && segment.ends_with('}') {
                format!(":{}", &segment[1..segment.len() - 1])
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn method_filter(method: &str) -> AppResult<MethodFilter> {
    let method = axum::http::Method::from_bytes(method.as_bytes())
        .map_err(|_| AppError::Config(format!("invalid http method {:?}", method)))?;
    MethodFilter::try_from(method)
        .map_err(|e| AppError::Config(format!("unsupported http method: {}", e)))
}

/// Process environment as a JSON mapping; keys and values are trimmed.
fn env_bundle() -> Value {
    let mut map = Map::new();
    for (key, value) in std::env::vars() {
        map.insert(key.trim().to_string(), Value::from(value.trim().to_string()));
    }
    Value::Object(map)
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        return text.to_string();
    }
    if let Some(text) = panic.downcast_ref::<String>() {
        return text.clone();
    }
    "panic".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axum_path_converts_placeholders() {
        assert_eq!(axum_path("/users/{id}"), "/users/:id");
        assert_eq!(axum_path("/a/{x}/b/{y}"), "/a/:x/b/:y");
        assert_eq!(axum_path("/plain"), "/plain");
        assert_eq!(axum_path("/"), "/");
    }

    #[test]
    fn method_filter_parses_common_methods() {
        for method in ["GET", "POST", "PUT", "DELETE", "PATCH"] {
            assert!(method_filter(method).is_ok(), "{}", method);
        }
        assert!(method_filter("NOT A METHOD").is_err());
    }

    #[test]
    fn env_bundle_is_an_object() {
        std::env::set_var("TASKGATE_TEST_ENV_KEY", "value");
        let env = env_bundle();
        assert_eq!(env["TASKGATE_TEST_ENV_KEY"], Value::from("value"));
    }

    #[test]
    fn descriptors_cover_every_method() {
        let mut config: Config = serde_json::from_str(
            r#"{
                "endpoints": [
                    {"path": "/a", "methods": {"GET": {"type": "shell"}, "POST": {"type": "http"}}},
                    {"path": "/b", "methods": {"GET": {"type": "info"}}}
                ]
            }"#,
        )
        .unwrap();
        config.validate().unwrap();

        let descriptors = route_descriptors(&config);
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[0].path, "/a");
        assert_eq!(descriptors[0].method, "GET");
        assert_eq!(descriptors[2].kind, "info");
        assert!(!descriptors[0].name.is_empty());
    }
}
