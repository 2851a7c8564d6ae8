//! Basic authorizer: compare `Authorization: Basic` credentials against a
//! configured username/password pair.

use axum::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use base64::prelude::{Engine, BASE64_STANDARD};
use serde::Deserialize;

use crate::config::AuthorizerConfig;
use crate::error::{AppError, AppResult};

use super::Authorizer;

#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuthorizerConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

pub struct BasicAuthorizer {
    config: BasicAuthorizerConfig,
}

pub fn factory(ac: &AuthorizerConfig) -> AppResult<Box<dyn Authorizer>> {
    let config: BasicAuthorizerConfig = serde_json::from_value(ac.config.clone())?;
    Ok(Box::new(BasicAuthorizer { config }))
}

/// Extract username/password from a `Basic` Authorization header. Any parse
/// failure yields [`AppError::InvalidAuthorizationHeader`].
pub fn basic_credentials(parts: &Parts) -> AppResult<(String, String)> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::InvalidAuthorizationHeader)?;

    let (scheme, encoded) = header
        .split_once(' ')
        .ok_or(AppError::InvalidAuthorizationHeader)?;
    if scheme != "Basic" {
        return Err(AppError::InvalidAuthorizationHeader);
    }

    let decoded = BASE64_STANDARD
        .decode(encoded.trim())
        .map_err(|_| AppError::InvalidAuthorizationHeader)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AppError::InvalidAuthorizationHeader)?;

    let (username, password) = decoded
        .split_once(':')
        .ok_or(AppError::InvalidAuthorizationHeader)?;

    Ok((username.to_string(), password.to_string()))
}

#[async_trait]
impl Authorizer for BasicAuthorizer {
    async fn authorize(&self, parts: &Parts) -> AppResult<()> {
        let (username, password) = basic_credentials(parts)?;

        if username != self.config.username || password != self.config.password {
            return Err(AppError::Unauthorized);
        }

        Ok(())
    }
}
