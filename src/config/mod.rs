//! Gateway configuration: file loading, endpoint/task model and validation.
//!
//! Config files are JSON or YAML, chosen by extension; YAML is converted to
//! a JSON value first and then decoded, so both formats share one model.
//! Unknown fields are tolerated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "Config::default_host")]
    pub host: String,

    #[serde(default = "Config::default_port")]
    pub port: u16,

    #[serde(default)]
    pub ssl: Option<SslConfig>,

    #[serde(default)]
    pub pretty_json: bool,

    /// Re-read the process environment on every request instead of once at
    /// server start.
    #[serde(default)]
    pub reload_env: bool,

    #[serde(default)]
    pub authorizers: HashMap<String, AuthorizerConfig>,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    /// Directory of the config file; the working directory for tasks.
    #[serde(skip)]
    pub directory: PathBuf,

    /// Original file bytes, retained so introspection may echo them.
    #[serde(skip)]
    pub raw: Vec<u8>,
}

impl Config {
    fn default_host() -> String {
        "0.0.0.0".to_string()
    }

    const fn default_port() -> u16 {
        9980
    }

    /// Load a config file; format is chosen by extension
    /// (`.json`, `.yaml`, `.yml`).
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read(path)?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let mut config: Config = match ext.as_str() {
            "json" => serde_json::from_slice(&raw)?,
            "yaml" | "yml" => {
                // yaml -> json value -> model, so both formats decode identically
                let value: Value = serde_yaml::from_slice(&raw)
                    .map_err(|e| AppError::Config(format!("yaml: {}", e)))?;
                serde_json::from_value(value)?
            }
            other => {
                return Err(AppError::Config(format!(
                    "unknown config file extension {:?}",
                    other
                )))
            }
        };

        config.directory = path
            .parent()
            .map(|p| p.to_path_buf())
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        config.raw = raw;

        config.validate()?;
        Ok(config)
    }

    /// Normalize and validate endpoints. Authorizer references are
    /// cross-checked later, when the authorizers are built.
    pub fn validate(&mut self) -> AppResult<()> {
        for endpoint in &mut self.endpoints {
            endpoint.validate()?;
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SslConfig {
    pub cert: String,
    pub key: String,
}

/// Authorizer declaration: a type tag plus a raw blob that only the
/// matching factory understands.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizerConfig {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub config: Value,
}

/// One declared endpoint: a path plus a task per HTTP method.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointConfig {
    pub path: String,

    /// Default task type, inherited by methods that declare none.
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub authorizers: Vec<String>,

    #[serde(default)]
    pub query_params: Option<QueryParams>,

    #[serde(default)]
    pub raw_response: bool,

    #[serde(default)]
    pub methods: HashMap<String, TaskConfig>,
}

impl EndpointConfig {
    pub fn validate(&mut self) -> AppResult<()> {
        self.path = self.path.trim().to_string();
        if self.path.is_empty() || !self.path.starts_with('/') {
            return Err(AppError::Config(format!(
                "endpoint path {:?} must start with /",
                self.path
            )));
        }

        if let Some(params) = &mut self.query_params {
            params.validate()?;
        }

        // methods without their own type inherit the endpoint type;
        // method names are normalized to upper case
        self.kind = self.kind.trim().to_string();
        let methods = std::mem::take(&mut self.methods);
        for (method, mut task) in methods {
            if task.kind.trim().is_empty() {
                task.kind = self.kind.clone();
            }
            task.validate().map_err(|e| {
                AppError::Config(format!("endpoint {} method {}: {}", self.path, method, e))
            })?;
            self.methods.insert(method.to_ascii_uppercase(), task);
        }

        Ok(())
    }

    /// Route identity: the content hash of the endpoint path. The info task
    /// uses this name to cross-link routes.
    pub fn route_name(&self) -> String {
        let mut hash = Sha256::new();
        hash.update(self.path.as_bytes());
        format!("{:x}", hash.finalize())
    }
}

/// Per-method task declaration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub authorizers: Vec<String>,

    /// Raw task config; decoded only by the task factory.
    #[serde(default)]
    pub config: Value,

    #[serde(default)]
    pub query_params: Option<QueryParams>,

    #[serde(default)]
    pub description: String,
}

impl TaskConfig {
    pub fn validate(&mut self) -> AppResult<()> {
        self.kind = self.kind.trim().to_string();
        self.description = self.description.trim().to_string();
        if self.kind.is_empty() {
            return Err(AppError::Config("missing task type".to_string()));
        }

        if let Some(params) = &mut self.query_params {
            params.validate()?;
        }

        Ok(())
    }
}

/// Declared query parameters for an endpoint or method.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParams {
    #[serde(default)]
    pub return_params: bool,

    #[serde(default)]
    pub params: Vec<QueryParam>,
}

impl QueryParams {
    /// Trim names and precompile patterns.
    pub fn validate(&mut self) -> AppResult<()> {
        for param in &mut self.params {
            param.name = param.name.trim().to_string();
            if param.name.is_empty() {
                return Err(AppError::Config("query param name missing".to_string()));
            }

            param.regexp = param.regexp.trim().to_string();
            if !param.regexp.is_empty() {
                // full-match semantics
                let anchored = format!("^(?:{})$", param.regexp);
                param.compiled = Some(Regex::new(&anchored).map_err(|e| {
                    AppError::Config(format!(
                        "query param regexp {:?} returned {}",
                        param.regexp, e
                    ))
                })?);
            }
        }
        Ok(())
    }

    /// Extract declared parameters from raw query pairs.
    ///
    /// Values are trimmed; an empty value falls back to the default, a
    /// pattern mismatch falls back to the default, and a parameter with no
    /// default and no acceptable value is absent from the result.
    pub fn extract(&self, raw: &HashMap<String, String>) -> HashMap<String, String> {
        let mut result = HashMap::new();

        for param in &self.params {
            let value = raw.get(&param.name).map(|v| v.trim()).unwrap_or("");

            if value.is_empty() {
                if !param.default.is_empty() {
                    result.insert(param.name.clone(), param.default.clone());
                }
                continue;
            }

            match &param.compiled {
                Some(pattern) if !pattern.is_match(value) => {
                    if !param.default.is_empty() {
                        result.insert(param.name.clone(), param.default.clone());
                    }
                }
                _ => {
                    result.insert(param.name.clone(), value.to_string());
                }
            }
        }

        result
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryParam {
    pub name: String,

    #[serde(default)]
    pub regexp: String,

    #[serde(default)]
    pub default: String,

    #[serde(skip)]
    compiled: Option<Regex>,
}
