//! LDAP authorizer: bind with the request's basic credentials, with
//! optional allow/deny lists checked first.

use axum::async_trait;
use axum::http::request::Parts;
use ldap3::LdapConnAsync;
use serde::Deserialize;

use crate::config::AuthorizerConfig;
use crate::error::{AppError, AppResult};

use super::{basic_credentials, Authorizer};

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 389;
const DEFAULT_NETWORK: &str = "tcp";

#[derive(Debug, Clone, Deserialize)]
pub struct LdapAuthorizerConfig {
    #[serde(default = "LdapAuthorizerConfig::default_host")]
    pub host: String,

    #[serde(default = "LdapAuthorizerConfig::default_port")]
    pub port: u16,

    /// `tcp` or `tls`; both are carried over TCP.
    #[serde(default = "LdapAuthorizerConfig::default_network")]
    pub network: String,

    #[serde(default)]
    pub allowlist: Vec<String>,

    #[serde(default)]
    pub denylist: Vec<String>,
}

impl LdapAuthorizerConfig {
    fn default_host() -> String {
        DEFAULT_HOST.to_string()
    }

    const fn default_port() -> u16 {
        DEFAULT_PORT
    }

    fn default_network() -> String {
        DEFAULT_NETWORK.to_string()
    }

    pub fn validate(&self) -> AppResult<()> {
        if !self.allowlist.is_empty() && !self.denylist.is_empty() {
            return Err(AppError::AllowDenyBothProvided);
        }
        if self.network != "tcp" && self.network != "tls" {
            return Err(AppError::UnknownNetwork);
        }
        Ok(())
    }

    fn url(&self) -> String {
        let scheme = if self.network == "tls" { "ldaps" } else { "ldap" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

pub struct LdapAuthorizer {
    config: LdapAuthorizerConfig,
}

pub fn factory(ac: &AuthorizerConfig) -> AppResult<Box<dyn Authorizer>> {
    let config: LdapAuthorizerConfig = serde_json::from_value(ac.config.clone())?;
    config.validate()?;
    Ok(Box::new(LdapAuthorizer { config }))
}

#[async_trait]
impl Authorizer for LdapAuthorizer {
    async fn authorize(&self, parts: &Parts) -> AppResult<()> {
        let (username, password) = basic_credentials(parts)?;

        let (conn, mut ldap) = LdapConnAsync::new(&self.config.url()).await?;
        ldap3::drive!(conn);

        if self.config.denylist.iter().any(|user| user == &username) {
            return Err(AppError::Denied);
        }

        if !self.config.allowlist.is_empty()
            && !self.config.allowlist.iter().any(|user| user == &username)
        {
            return Err(AppError::NotAllowed);
        }

        ldap.simple_bind(&username, &password).await?.success()?;
        Ok(())
    }
}
