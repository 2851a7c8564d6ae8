//! Postgres task: run configured queries and return rows as maps.

use axum::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, Connection, PgConnection, Row};

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::response::Envelope;
use crate::template;

use super::{compose, single_result_index, FactoryContext, Task, TaskOutput, TaskRequest};

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresTaskConfig {
    #[serde(default)]
    pub queries: Vec<SqlQuery>,

    /// Echo the rendered statement and args in each sub-result.
    #[serde(default)]
    pub return_queries: bool,

    #[serde(default)]
    pub single_result: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqlQuery {
    pub url: String,
    pub query: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl PostgresTaskConfig {
    pub fn validate(&mut self) -> AppResult<()> {
        if self.queries.is_empty() {
            return Err(AppError::Config(
                "postgres task needs at least one query".to_string(),
            ));
        }
        for query in &mut self.queries {
            query.url = query.url.trim().to_string();
            query.query = query.query.trim().to_string();
            if query.url.is_empty() {
                return Err(AppError::Config("postgres query url missing".to_string()));
            }
            if query.query.is_empty() {
                return Err(AppError::Config("postgres query missing".to_string()));
            }
        }
        self.single_result =
            single_result_index(self.single_result, self.queries.len(), "postgres task")?;
        Ok(())
    }
}

pub struct PostgresTask {
    config: PostgresTaskConfig,
}

pub fn factory(
    _ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let mut config: PostgresTaskConfig = serde_json::from_value(tc.config.clone())?;
    config.validate()?;
    Ok(vec![Box::new(PostgresTask { config })])
}

/// Attach the SQLSTATE as `error_code` when the driver exposes one.
fn sql_error(sub: Envelope, err: sqlx::Error) -> Envelope {
    let sub = match &err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => sub.data("error_code", code.as_ref()),
            None => sub,
        },
        _ => sub,
    };
    sub.error(err)
}

fn row_to_map(row: &PgRow) -> Map<String, Value> {
    let mut map = Map::new();
    for column in row.columns() {
        map.insert(column.name().to_string(), decode_column(row, column.ordinal()));
    }
    map
}

/// Decode a column into a JSON value by trying common types in order;
/// unsupported types become null.
fn decode_column(row: &PgRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i16>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(idx) {
        return v.unwrap_or(Value::Null);
    }
    Value::Null
}

impl PostgresTask {
    async fn run_query(&self, query: &SqlQuery, req: &TaskRequest) -> Envelope {
        let mut sub = Envelope::ok().strip_status_data();

        let url = match template::render(&query.url, &req.vars) {
            Ok(url) => url,
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

        let mut conn = match PgConnection::connect(&url).await {
            Ok(conn) => conn,
            Err(e) => return sql_error(sub, e),
        };

        let mut prepared = sqlx::query(&statement);
        for arg in &args {
            prepared = prepared.bind(arg);
        }

        match prepared.fetch_all(&mut conn).await {
            Ok(rows) => {
                let rows: Vec<Value> = rows
                    .iter()
                    .map(|row| Value::Object(row_to_map(row)))
                    .collect();
                sub.result(rows)
            }
            Err(e) => sql_error(sub, e),
        }
    }
}

#[async_trait]
impl Task for PostgresTask {
    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        let mut results = Vec::with_capacity(self.config.queries.len());

        for query in &self.config.queries {
            results.push(self.run_query(query, req).await);
        }

        compose(results, self.config.single_result).into()
    }
}
