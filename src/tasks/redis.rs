//! Redis task: run configured commands and coerce replies by declared
//! type.

use axum::async_trait;
use redis::{from_redis_value, FromRedisValue};
use serde::Deserialize;
use serde_json::Value;

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::response::Envelope;
use crate::template;

use super::{compose, single_result_index, FactoryContext, Task, TaskOutput, TaskRequest};

/// Reply coercions the task understands.
const REPLY_TYPES: [&str; 10] = [
    "bool", "float64", "int", "int64", "ints", "string", "strings", "uint64", "values",
    "stringmap",
];

#[derive(Debug, Clone, Deserialize)]
pub struct RedisTaskConfig {
    #[serde(default = "RedisTaskConfig::default_address")]
    pub address: String,

    #[serde(default = "RedisTaskConfig::default_database")]
    pub database: i64,

    #[serde(default = "RedisTaskConfig::default_network")]
    pub network: String,

    #[serde(default)]
    pub queries: Vec<RedisQuery>,

    #[serde(default)]
    pub return_queries: bool,

    #[serde(default)]
    pub single_result: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisQuery {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(rename = "type")]
    pub kind: String,
}

impl RedisTaskConfig {
    fn default_address() -> String {
        ":6379".to_string()
    }

    const fn default_database() -> i64 {
        1
    }

    fn default_network() -> String {
        "tcp".to_string()
    }

    pub fn validate(&mut self) -> AppResult<()> {
        if self.queries.is_empty() {
            return Err(AppError::Config(
                "redis task needs at least one query".to_string(),
            ));
        }
        if self.network != "tcp" && self.network != "unix" {
            return Err(AppError::UnknownNetwork);
        }
        for query in &self.queries {
            if !REPLY_TYPES.contains(&query.kind.as_str()) {
                return Err(AppError::Config(format!(
                    "unknown redis type {}",
                    query.kind
                )));
            }
        }
        self.single_result =
            single_result_index(self.single_result, self.queries.len(), "redis task")?;
        Ok(())
    }

    fn connection_url(&self, address: &str) -> String {
        if self.network == "unix" {
            return format!("redis+unix://{}?db={}", address, self.database);
        }
        // bare ":port" means localhost
        let address = if address.starts_with(':') {
            format!("127.0.0.1{}", address)
        } else {
            address.to_string()
        };
        format!("redis://{}/{}", address, self.database)
    }
}

pub struct RedisTask {
    config: RedisTaskConfig,
}

pub fn factory(
    _ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let mut config: RedisTaskConfig = serde_json::from_value(tc.config.clone())?;
    config.validate()?;
    Ok(vec![Box::new(RedisTask { config })])
}

fn typed<T: FromRedisValue + serde::Serialize>(reply: &redis::Value) -> Result<Value, redis::RedisError> {
    from_redis_value::<T>(reply).map(|v| serde_json::to_value(v).unwrap_or(Value::Null))
}

/// Untyped fallback mirroring the wire shape.
fn reply_to_json(reply: &redis::Value) -> Value {
    match reply {
        redis::Value::Nil => Value::Null,
        redis::Value::Int(n) => Value::from(*n),
        redis::Value::Data(bytes) => Value::from(String::from_utf8_lossy(bytes).to_string()),
        redis::Value::Bulk(items) => Value::from(items.iter().map(reply_to_json).collect::<Vec<_>>()),
        redis::Value::Status(s) => Value::from(s.clone()),
        redis::Value::Okay => Value::from("OK"),
    }
}

fn coerce(reply: &redis::Value, kind: &str) -> Result<Value, redis::RedisError> {
    match kind {
        "bool" => typed::<bool>(reply),
        "float64" => typed::<f64>(reply),
        "int" | "int64" => typed::<i64>(reply),
        "uint64" => typed::<u64>(reply),
        "ints" => typed::<Vec<i64>>(reply),
        "string" => typed::<String>(reply),
        "strings" => typed::<Vec<String>>(reply),
        "stringmap" => typed::<std::collections::HashMap<String, String>>(reply),
        _ => Ok(reply_to_json(reply)),
    }
}

impl RedisTask {
    async fn run_query(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        query: &RedisQuery,
        req: &TaskRequest,
    ) -> Envelope {
        let mut sub = Envelope::ok().strip_status_data();

        let mut args = Vec::with_capacity(query.args.len());
        for arg in &query.args {
            match template::render(arg, &req.vars) {
                Ok(rendered) => args.push(rendered),
                Err(e) => return sub.error(e),
            }
        }

        if self.config.return_queries {
            sub = sub.data("command", &query.command).data("args", &args);
        }

        let mut command = redis::cmd(&query.command);
        for arg in &args {
            command.arg(arg);
        }

        let reply: redis::Value = match command.query_async(conn).await {
            Ok(reply) => reply,
            Err(e) => return sub.error(e),
        };

        if reply == redis::Value::Nil {
            return sub.error("not found");
        }

        match coerce(&reply, &query.kind) {
            Ok(value) => sub.result(value),
            Err(e) => sub.error(e),
        }
    }
}

#[async_trait]
impl Task for RedisTask {
    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        let address = match template::render(&self.config.address, &req.vars) {
            Ok(address) => address,
            Err(e) => return TaskOutput::Envelope(Envelope::ok().error(e)),
        };

        let client = match redis::Client::open(self.config.connection_url(&address)) {
            Ok(client) => client,
            Err(e) => return TaskOutput::Envelope(Envelope::ok().error(e)),
        };
        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => return TaskOutput::Envelope(Envelope::ok().error(e)),
        };

        let mut results = Vec::with_capacity(self.config.queries.len());
        for query in &self.config.queries {
            results.push(self.run_query(&mut conn, query, req).await);
        }

        compose(results, self.config.single_result).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(queries: Vec<RedisQuery>) -> RedisTaskConfig {
        RedisTaskConfig {
            address: RedisTaskConfig::default_address(),
            database: 1,
            network: "tcp".to_string(),
            queries,
            return_queries: false,
            single_result: None,
        }
    }

    fn query(command: &str, kind: &str) -> RedisQuery {
        RedisQuery {
            command: command.to_string(),
            args: vec![],
            kind: kind.to_string(),
        }
    }

    #[test]
    fn validate_rejects_unknown_reply_type() {
        let mut c = config(vec![query("GET", "complex128")]);
        assert!(c.validate().is_err());

        let mut c = config(vec![query("GET", "string")]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_unknown_network() {
        let mut c = config(vec![query("GET", "string")]);
        c.network = "udp".to_string();
        assert!(matches!(c.validate(), Err(AppError::UnknownNetwork)));
    }

    #[test]
    fn bare_port_address_means_localhost() {
        let c = config(vec![query("GET", "string")]);
        assert_eq!(c.connection_url(":6379"), "redis://127.0.0.1:6379/1");
        assert_eq!(c.connection_url("cache:6379"), "redis://cache:6379/1");
    }

    #[test]
    fn coerce_typed_replies() {
        let reply = redis::Value::Data(b"42".to_vec());
        assert_eq!(coerce(&reply, "int").unwrap(), json!(42));
        assert_eq!(coerce(&reply, "string").unwrap(), json!("42"));

        let bulk = redis::Value::Bulk(vec![
            redis::Value::Data(b"a".to_vec()),
            redis::Value::Data(b"b".to_vec()),
        ]);
        assert_eq!(coerce(&bulk, "strings").unwrap(), json!(["a", "b"]));
        assert_eq!(
            coerce(&bulk, "stringmap").unwrap(),
            json!({"a": "b"})
        );
    }

    #[test]
    fn untyped_values_mirror_wire_shape() {
        let bulk = redis::Value::Bulk(vec![
            redis::Value::Int(1),
            redis::Value::Data(b"x".to_vec()),
            redis::Value::Nil,
        ]);
        assert_eq!(coerce(&bulk, "values").unwrap(), json!([1, "x", null]));
    }
}
