//! Info task: introspection over the server's configured routes.

use axum::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use serde::Deserialize;
use serde_json::json;

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::AppResult;
use crate::response::Envelope;

use super::{FactoryContext, Task, TaskOutput, TaskRequest};

/// Static description of one materialized route.
#[derive(Debug, Clone)]
pub struct RouteDescriptor {
    pub path: String,
    pub method: String,
    pub kind: String,
    pub description: String,
    pub authorizers: Vec<String>,
    /// Content hash of the endpoint path; cross-links routes in output.
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfoTaskConfig {
    /// Echo the raw config file (base64) in the output.
    #[serde(default)]
    pub return_config: bool,
}

pub struct InfoTask {
    version: String,
    routes: Vec<RouteDescriptor>,
    raw_config: Option<Vec<u8>>,
}

pub fn factory(
    ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let config: InfoTaskConfig = serde_json::from_value(tc.config.clone())?;

    // routes of type info are excluded so the endpoint does not describe
    // itself recursively
    let routes = ctx
        .routes
        .iter()
        .filter(|route| route.kind != "info")
        .cloned()
        .collect();

    Ok(vec![Box::new(InfoTask {
        version: ctx.version.to_string(),
        routes,
        raw_config: config.return_config.then(|| ctx.raw_config.to_vec()),
    })])
}

#[async_trait]
impl Task for InfoTask {
    async fn run(&self, _req: &TaskRequest) -> TaskOutput {
        let endpoints: Vec<Envelope> = self
            .routes
            .iter()
            .map(|route| {
                let mut entry = Envelope::ok()
                    .strip_status_data()
                    .data("path", &route.path)
                    .data("method", &route.method)
                    .data("type", &route.kind);
                if !route.description.is_empty() {
                    entry = entry.data("description", &route.description);
                }
                if !route.authorizers.is_empty() {
                    entry = entry.data("authorizers", &route.authorizers);
                }
                entry
            })
            .collect();

        let mut result = json!({
            "version": self.version,
            "endpoints": endpoints,
        });
        if let Some(raw) = &self.raw_config {
            result["config"] = json!(BASE64_STANDARD.encode(raw));
        }

        Envelope::ok().result(result).into()
    }
}
