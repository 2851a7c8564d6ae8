//! MySQL task: run configured queries and return rows as maps.

use axum::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::mysql::MySqlRow;
use sqlx::{Column, Connection, MySqlConnection, Row};

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::response::Envelope;
use crate::template;

use super::postgres::SqlQuery;
use super::{compose, single_result_index, FactoryContext, Task, TaskOutput, TaskRequest};

#[derive(Debug, Clone, Deserialize)]
pub struct MysqlTaskConfig {
    #[serde(default)]
    pub queries: Vec<SqlQuery>,

    #[serde(default)]
    pub return_queries: bool,

    #[serde(default)]
    pub single_result: Option<usize>,
}

impl MysqlTaskConfig {
    pub fn validate(&mut self) -> AppResult<()> {
        if self.queries.is_empty() {
            return Err(AppError::Config(
                "mysql task needs at least one query".to_string(),
            ));
        }
        for query in &mut self.queries {
            query.url = query.url.trim().to_string();
            query.query = query.query.trim().to_string();
            if query.url.is_empty() {
                return Err(AppError::Config("mysql query url missing".to_string()));
            }
            if query.query.is_empty() {
                return Err(AppError::Config("mysql query missing".to_string()));
            }
        }
        self.single_result =
            single_result_index(self.single_result, self.queries.len(), "mysql task")?;
        Ok(())
    }
}

pub struct MysqlTask {
    config: MysqlTaskConfig,
}

pub fn factory(
    _ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let mut config: MysqlTaskConfig = serde_json::from_value(tc.config.clone())?;
    config.validate()?;
    Ok(vec![Box::new(MysqlTask { config })])
}

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

fn row_to_map(row: &MySqlRow) -> Map<String, Value> {
    let mut map = Map::new();
    for column in row.columns() {
        map.insert(column.name().to_string(), decode_column(row, column.ordinal()));
    }
    map
}

fn decode_column(row: &MySqlRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<u64>, _>(idx) {
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

impl MysqlTask {
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

        let mut conn = match MySqlConnection::connect(&url).await {
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
impl Task for MysqlTask {
    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        let mut results = Vec::with_capacity(self.config.queries.len());

        for query in &self.config.queries {
            results.push(self.run_query(query, req).await);
        }

        compose(results, self.config.single_result).into()
    }
}
