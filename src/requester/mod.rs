//! Shared outbound HTTP client used by the http task and http authorizer.

use std::time::Duration;

use axum::http::Method;

use crate::error::{AppError, AppResult};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin wrapper around a reqwest client with the gateway's dial timeout.
#[derive(Debug, Clone)]
pub struct Requester {
    client: reqwest::Client,
}

impl Requester {
    pub fn new() -> AppResult<Self> {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().connect_timeout(timeout).build()?;
        Ok(Requester { client })
    }

    /// Send a request with an optional text body.
    pub async fn send(
        &self,
        method: &str,
        url: &str,
        body: Option<String>,
    ) -> AppResult<reqwest::Response> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| AppError::Task(format!("invalid http method {:?}", method)))?;

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }
}
