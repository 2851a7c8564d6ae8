//! Outbound HTTP task: call configured URLs and fold the upstream
//! responses into the envelope.

use std::collections::HashMap;

use axum::async_trait;
use serde::Deserialize;

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::formats;
use crate::requester::Requester;
use crate::response::Envelope;
use crate::template;

use super::{compose, single_result_index, FactoryContext, Task, TaskOutput, TaskRequest};

#[derive(Debug, Clone, Deserialize)]
pub struct HttpTaskConfig {
    #[serde(default)]
    pub urls: Vec<HttpTaskUrl>,

    #[serde(default)]
    pub single_result: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpTaskUrl {
    pub url: String,

    /// Override for the upstream method; the inbound method is used when
    /// blank.
    #[serde(default)]
    pub method: String,

    /// Forward the inbound request body upstream.
    #[serde(default)]
    pub post_body: bool,

    #[serde(default)]
    pub format: String,

    #[serde(default)]
    pub return_headers: bool,
}

impl HttpTaskConfig {
    pub fn validate(&mut self) -> AppResult<()> {
        if self.urls.is_empty() {
            return Err(AppError::Config(
                "http task must provide at least one url".to_string(),
            ));
        }
        for url in &mut self.urls {
            url.url = url.url.trim().to_string();
            if url.url.is_empty() {
                return Err(AppError::Config("invalid url in http task".to_string()));
            }
            template::verify(&url.url)?;
            url.format = formats::verify(&url.format)?;
        }
        self.single_result = single_result_index(self.single_result, self.urls.len(), "http task")?;
        Ok(())
    }
}

pub struct HttpTask {
    config: HttpTaskConfig,
    requester: Requester,
}

pub fn factory(
    ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let mut config: HttpTaskConfig = serde_json::from_value(tc.config.clone())?;
    config.validate()?;
    Ok(vec![Box::new(HttpTask {
        config,
        requester: ctx.requester.clone(),
    })])
}

impl HttpTask {
    async fn run_url(&self, url: &HttpTaskUrl, req: &TaskRequest) -> Envelope {
        let mut sub = Envelope::ok().strip_status_data();

        let rendered = match template::render(&url.url, &req.vars) {
            Ok(rendered) => rendered,
            Err(e) => return sub.error(e),
        };

        let method = if url.method.is_empty() {
            req.method.as_str()
        } else {
            url.method.as_str()
        };
        let body = url.post_body.then(|| req.body.clone());

        let response = match self.requester.send(method, &rendered, body).await {
            Ok(response) => response,
            Err(e) => return sub.error(e),
        };

        // upstream status is carried on the sub-envelope
        sub = sub.status(response.status().as_u16());

        if url.return_headers {
            let mut headers: HashMap<String, Vec<String>> = HashMap::new();
            for (name, value) in response.headers() {
                headers
                    .entry(name.to_string())
                    .or_default()
                    .push(String::from_utf8_lossy(value.as_bytes()).to_string());
            }
            sub = sub.data("headers", headers);
        }

        // auto-enable json parsing when the upstream advertises it
        let mut format = url.format.clone();
        let content_type = response
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if content_type.contains("application/json") {
            format = formats::add(&format, "json");
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => return sub.error(e),
        };

        match formats::format(&text, &format) {
            Ok((value, chosen)) => sub.result(value).data("format", chosen),
            Err(e) => sub.error(e),
        }
    }
}

#[async_trait]
impl Task for HttpTask {
    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        let mut results = Vec::with_capacity(self.config.urls.len());

        for url in &self.config.urls {
            results.push(self.run_url(url, req).await);
        }

        compose(results, self.config.single_result).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(u: &str) -> HttpTaskUrl {
        HttpTaskUrl {
            url: u.to_string(),
            method: String::new(),
            post_body: false,
            format: String::new(),
            return_headers: false,
        }
    }

    #[test]
    fn validate_requires_urls() {
        let mut config = HttpTaskConfig {
            urls: vec![],
            single_result: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_blank_url() {
        let mut config = HttpTaskConfig {
            urls: vec![url("   ")],
            single_result: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_appends_text_format() {
        let mut config = HttpTaskConfig {
            urls: vec![url("http://example.com")],
            single_result: None,
        };
        config.validate().unwrap();
        assert_eq!(config.urls[0].format, "text");
    }

    #[test]
    fn validate_checks_single_result_bounds() {
        let mut config = HttpTaskConfig {
            urls: vec![url("http://example.com")],
            single_result: Some(3),
        };
        assert!(config.validate().is_err());
    }
}
