//! HTTP authorizer: delegate credential verification to an external URL.

use axum::async_trait;
use axum::http::request::Parts;
use serde::Deserialize;
use serde_json::json;

use crate::config::AuthorizerConfig;
use crate::error::{AppError, AppResult};
use crate::requester::Requester;
use crate::template;

use super::{basic_credentials, Authorizer};

#[derive(Debug, Clone, Deserialize)]
pub struct HttpAuthorizerConfig {
    pub url: String,

    #[serde(default = "HttpAuthorizerConfig::default_method")]
    pub method: String,

    /// Request body template.
    #[serde(default)]
    pub data: String,
}

impl HttpAuthorizerConfig {
    fn default_method() -> String {
        "GET".to_string()
    }

    pub fn validate(&mut self) -> AppResult<()> {
        self.url = self.url.trim().to_string();
        self.method = self.method.trim().to_string();
        self.data = self.data.trim().to_string();

        if self.url.is_empty() {
            return Err(AppError::Config("http authorizer url missing".to_string()));
        }
        template::verify(&self.url)?;
        template::verify(&self.method)?;
        template::verify(&self.data)?;

        Ok(())
    }
}

pub struct HttpAuthorizer {
    config: HttpAuthorizerConfig,
    requester: Requester,
}

pub fn factory(ac: &AuthorizerConfig) -> AppResult<Box<dyn Authorizer>> {
    let mut config: HttpAuthorizerConfig = serde_json::from_value(ac.config.clone())?;
    config.validate()?;
    Ok(Box::new(HttpAuthorizer {
        config,
        requester: Requester::new()?,
    }))
}

#[async_trait]
impl Authorizer for HttpAuthorizer {
    async fn authorize(&self, parts: &Parts) -> AppResult<()> {
        // templates render over the request's basic credentials when present
        let (username, password) = basic_credentials(parts).unwrap_or_default();
        let data = json!({
            "username": username,
            "password": password,
        });

        let url = template::render(&self.config.url, &data)?;
        let method = template::render(&self.config.method, &data)?;
        let body = template::render(&self.config.data, &data)?;

        let body = if body.is_empty() { None } else { Some(body) };
        let response = self.requester.send(&method, &url, body).await?;

        if !response.status().is_success() {
            return Err(AppError::Unauthorized);
        }

        Ok(())
    }
}
