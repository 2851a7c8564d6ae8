//! Request authorization: registry of authorizer factories and the
//! per-request authorizer chain.

mod basic;
mod http;
mod ldap;

pub use basic::{basic_credentials, BasicAuthorizer};
pub use http::HttpAuthorizer;
pub use ldap::LdapAuthorizer;

use std::collections::HashMap;
use std::sync::Arc;

use axum::async_trait;
use axum::http::request::Parts;

use crate::config::{AuthorizerConfig, Config, EndpointConfig};
use crate::error::{AppError, AppResult};

/// An authorizer accepts or rejects a request based on credentials.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, parts: &Parts) -> AppResult<()>;
}

/// Builds an authorizer from its raw config blob.
pub type AuthorizerFactory = fn(&AuthorizerConfig) -> AppResult<Box<dyn Authorizer>>;

/// Name -> factory table, filled at startup.
pub struct AuthorizerRegistry {
    factories: HashMap<String, AuthorizerFactory>,
}

impl AuthorizerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        AuthorizerRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in authorizers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("basic", basic::factory);
        registry.register("ldap", ldap::factory);
        registry.register("http", http::factory);
        registry
    }

    /// Register a factory. Panics when the name is already taken.
    pub fn register(&mut self, name: &str, factory: AuthorizerFactory) {
        if self.factories.contains_key(name) {
            panic!("authorizer {} already registered", name);
        }
        self.factories.insert(name.to_string(), factory);
    }

    pub fn exists(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate every configured authorizer and cross-check that every
    /// authorizer name referenced by an endpoint or method exists.
    pub fn build_all(&self, config: &Config) -> AppResult<Authorizers> {
        let mut built = HashMap::new();

        for (name, ac) in &config.authorizers {
            let factory = self.factories.get(&ac.kind).ok_or_else(|| {
                AppError::Config(format!("authorizer type {:?} does not exist", ac.kind))
            })?;
            let authorizer = factory(ac)
                .map_err(|e| AppError::Config(format!("authorizer {:?}: {}", name, e)))?;
            built.insert(name.clone(), Arc::from(authorizer));
        }

        for endpoint in &config.endpoints {
            for name in &endpoint.authorizers {
                if !built.contains_key(name) {
                    return Err(AppError::Config(format!(
                        "endpoint {:?} references unknown authorizer {:?}",
                        endpoint.path, name
                    )));
                }
            }
            for (method, task) in &endpoint.methods {
                for name in &task.authorizers {
                    if !built.contains_key(name) {
                        return Err(AppError::Config(format!(
                            "endpoint {:?} method {} references unknown authorizer {:?}",
                            endpoint.path, method, name
                        )));
                    }
                }
            }
        }

        Ok(Authorizers { map: built })
    }
}

impl Default for AuthorizerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// All built authorizers, checked as a chain per request.
#[derive(Clone, Default)]
pub struct Authorizers {
    map: HashMap<String, Arc<dyn Authorizer>>,
}

impl Authorizers {
    /// Run endpoint-level authorizers followed by method-level ones, in
    /// listed order; the first failure wins. An empty chain permits.
    pub async fn check(&self, parts: &Parts, endpoint: &EndpointConfig) -> AppResult<()> {
        let method_names = endpoint
            .methods
            .get(parts.method.as_str())
            .map(|task| task.authorizers.as_slice())
            .unwrap_or_default();

        for name in endpoint.authorizers.iter().chain(method_names) {
            let authorizer = self
                .map
                .get(name)
                .ok_or_else(|| AppError::Config(format!("unknown authorizer {:?}", name)))?;
            authorizer.authorize(parts).await?;
        }

        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use axum::http::Request;
    use serde_json::json;

    struct Always(bool);

    #[async_trait]
    impl Authorizer for Always {
        async fn authorize(&self, _parts: &Parts) -> AppResult<()> {
            if self.0 {
                Ok(())
            } else {
                Err(AppError::Unauthorized)
            }
        }
    }

    fn parts(method: &str) -> Parts {
        Request::builder()
            .method(method)
            .uri("/x")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn endpoint(authorizers: Vec<&str>, method_authorizers: Vec<&str>) -> EndpointConfig {
        EndpointConfig {
            path: "/x".to_string(),
            authorizers: authorizers.into_iter().map(String::from).collect(),
            methods: HashMap::from([(
                "GET".to_string(),
                TaskConfig {
                    kind: "shell".to_string(),
                    authorizers: method_authorizers.into_iter().map(String::from).collect(),
                    ..TaskConfig::default()
                },
            )]),
            ..EndpointConfig::default()
        }
    }

    fn authorizers(entries: Vec<(&str, bool)>) -> Authorizers {
        Authorizers {
            map: entries
                .into_iter()
                .map(|(name, ok)| {
                    (
                        name.to_string(),
                        Arc::new(Always(ok)) as Arc<dyn Authorizer>,
                    )
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn empty_chain_permits() {
        let auth = Authorizers::default();
        assert!(auth.check(&parts("GET"), &endpoint(vec![], vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn first_failure_short_circuits() {
        let auth = authorizers(vec![("deny", false), ("allow", true)]);
        let err = auth
            .check(&parts("GET"), &endpoint(vec!["deny"], vec!["allow"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized));

        // endpoint-level runs before method-level
        let auth = authorizers(vec![("allow", true), ("deny", false)]);
        assert!(auth
            .check(&parts("GET"), &endpoint(vec!["allow"], vec![]))
            .await
            .is_ok());
        assert!(auth
            .check(&parts("GET"), &endpoint(vec!["allow"], vec!["deny"]))
            .await
            .is_err());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = AuthorizerRegistry::builtin();
        registry.register("basic", basic::factory);
    }

    #[test]
    fn build_all_rejects_dangling_reference() {
        let registry = AuthorizerRegistry::builtin();
        let mut config = Config {
            host: "0.0.0.0".into(),
            port: 9980,
            ssl: None,
            pretty_json: false,
            reload_env: false,
            authorizers: HashMap::new(),
            endpoints: vec![endpoint(vec!["nope"], vec![])],
            directory: Default::default(),
            raw: Vec::new(),
        };
        config.validate().unwrap();
        assert!(matches!(
            registry.build_all(&config),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn build_all_rejects_unknown_type() {
        let registry = AuthorizerRegistry::builtin();
        let config = Config {
            host: "0.0.0.0".into(),
            port: 9980,
            ssl: None,
            pretty_json: false,
            reload_env: false,
            authorizers: HashMap::from([(
                "a".to_string(),
                AuthorizerConfig {
                    kind: "bogus".to_string(),
                    config: json!({}),
                },
            )]),
            endpoints: vec![],
            directory: Default::default(),
            raw: Vec::new(),
        };
        assert!(matches!(
            registry.build_all(&config),
            Err(AppError::Config(_))
        ));
    }
}
