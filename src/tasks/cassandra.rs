//! Cassandra task: run CQL queries against a configured cluster.

use axum::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use scylla::frame::response::result::CqlValue;
use scylla::SessionBuilder;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::response::Envelope;
use crate::template;

use super::{compose, single_result_index, FactoryContext, Task, TaskOutput, TaskRequest};

#[derive(Debug, Clone, Deserialize)]
pub struct CassandraTaskConfig {
    #[serde(default)]
    pub queries: Vec<CassandraQuery>,

    #[serde(default)]
    pub return_queries: bool,

    #[serde(default)]
    pub single_result: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CassandraQuery {
    /// Cluster contact points; templates.
    #[serde(default)]
    pub cluster: Vec<String>,

    pub keyspace: String,
    pub query: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl CassandraTaskConfig {
    pub fn validate(&mut self) -> AppResult<()> {
        if self.queries.is_empty() {
            return Err(AppError::Config(
                "cassandra task needs at least one query".to_string(),
            ));
        }
        for query in &mut self.queries {
            if query.cluster.is_empty() {
                return Err(AppError::Config(
                    "cassandra cluster must have at least one host".to_string(),
                ));
            }
            query.keyspace = query.keyspace.trim().to_string();
            if query.keyspace.is_empty() {
                return Err(AppError::Config("cassandra keyspace missing".to_string()));
            }
        }
        self.single_result =
            single_result_index(self.single_result, self.queries.len(), "cassandra task")?;
        Ok(())
    }
}

pub struct CassandraTask {
    config: CassandraTaskConfig,
}

pub fn factory(
    _ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let mut config: CassandraTaskConfig = serde_json::from_value(tc.config.clone())?;
    config.validate()?;
    Ok(vec![Box::new(CassandraTask { config })])
}

/// CQL value to JSON; binary becomes base64, exotic types become null.
fn cql_to_json(value: &CqlValue) -> Value {
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => Value::from(s.clone()),
        CqlValue::Boolean(b) => Value::from(*b),
        CqlValue::TinyInt(n) => Value::from(*n),
        CqlValue::SmallInt(n) => Value::from(*n),
        CqlValue::Int(n) => Value::from(*n),
        CqlValue::BigInt(n) => Value::from(*n),
        CqlValue::Float(n) => Value::from(*n),
        CqlValue::Double(n) => Value::from(*n),
        CqlValue::Blob(bytes) => Value::from(BASE64_STANDARD.encode(bytes)),
        CqlValue::Uuid(id) => Value::from(id.to_string()),
        CqlValue::Timeuuid(id) => Value::from(id.to_string()),
        CqlValue::Inet(addr) => Value::from(addr.to_string()),
        CqlValue::List(items) | CqlValue::Set(items) => {
            Value::from(items.iter().map(cql_to_json).collect::<Vec<_>>())
        }
        CqlValue::Map(pairs) => {
            let mut map = Map::new();
            for (key, value) in pairs {
                let key = match key {
                    CqlValue::Ascii(s) | CqlValue::Text(s) => s.clone(),
                    other => match cql_to_json(other) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    },
                };
                map.insert(key, cql_to_json(value));
            }
            Value::Object(map)
        }
        CqlValue::Tuple(items) => Value::from(
            items
                .iter()
                .map(|item| item.as_ref().map(cql_to_json).unwrap_or(Value::Null))
                .collect::<Vec<_>>(),
        ),
        _ => Value::Null,
    }
}

impl CassandraTask {
    async fn run_query(&self, query: &CassandraQuery, req: &TaskRequest) -> Envelope {
        let mut sub = Envelope::ok().strip_status_data();

        let mut hosts = Vec::with_capacity(query.cluster.len());
        for host in &query.cluster {
            match template::render(host, &req.vars) {
                Ok(rendered) => hosts.push(rendered),
                Err(e) => return sub.error(e),
            }
        }

        let keyspace = match template::render(&query.keyspace, &req.vars) {
            Ok(keyspace) => keyspace,
            Err(e) => return sub.error(e),
        };
        let statement = match template::render(&query.query, &req.vars) {
            Ok(statement) => statement,
            Err(e) => return sub.error(e),
        };

        let mut args = Vec::with_capacity(query.args.len());
        for arg in &query.args {
            match template::render(arg, &req.vars) {
                Ok(rendered) => args.push(rendered),
                Err(e) => return sub.error(e),
            }
        }

        if self.config.return_queries {
            sub = sub.data("query", &statement).data("args", &args);
        }

        let session = match SessionBuilder::new().known_nodes(&hosts).build().await {
            Ok(session) => session,
            Err(e) => return sub.error(e),
        };
        if let Err(e) = session.use_keyspace(&keyspace, false).await {
            return sub.error(e);
        }

        let result = match session.query(statement, args).await {
            Ok(result) => result,
            Err(e) => return sub.error(e),
        };

        let names: Vec<String> = result
            .col_specs
            .iter()
            .map(|spec| spec.name.clone())
            .collect();

        let mut rows = Vec::new();
        for row in result.rows.unwrap_or_default() {
            let mut map = Map::new();
            for (idx, column) in row.columns.iter().enumerate() {
                let name = names
                    .get(idx)
                    .cloned()
                    .unwrap_or_else(|| idx.to_string());
                map.insert(
                    name,
                    column.as_ref().map(cql_to_json).unwrap_or(Value::Null),
                );
            }
            rows.push(Value::Object(map));
        }

        sub.result(rows)
    }
}

#[async_trait]
impl Task for CassandraTask {
    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        let mut results = Vec::with_capacity(self.config.queries.len());

        for query in &self.config.queries {
            results.push(self.run_query(query, req).await);
        }

        compose(results, self.config.single_result).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn query(cluster: Vec<&str>, keyspace: &str) -> CassandraQuery {
        CassandraQuery {
            cluster: cluster.into_iter().map(String::from).collect(),
            keyspace: keyspace.to_string(),
            query: "select * from t".to_string(),
            args: vec![],
        }
    }

    #[test]
    fn validate_requires_cluster_and_keyspace() {
        let mut config = CassandraTaskConfig {
            queries: vec![query(vec![], "ks")],
            return_queries: false,
            single_result: None,
        };
        assert!(config.validate().is_err());

        let mut config = CassandraTaskConfig {
            queries: vec![query(vec!["localhost"], "  ")],
            return_queries: false,
            single_result: None,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn cql_values_map_to_json() {
        assert_eq!(cql_to_json(&CqlValue::Text("x".to_string())), json!("x"));
        assert_eq!(cql_to_json(&CqlValue::Int(7)), json!(7));
        assert_eq!(cql_to_json(&CqlValue::Boolean(true)), json!(true));
        assert_eq!(cql_to_json(&CqlValue::Blob(b"hi".to_vec())), json!("aGk="));
        assert_eq!(
            cql_to_json(&CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2)])),
            json!([1, 2])
        );
        assert_eq!(
            cql_to_json(&CqlValue::Map(vec![(
                CqlValue::Text("k".to_string()),
                CqlValue::Int(1)
            )])),
            json!({"k": 1})
        );
    }
}
