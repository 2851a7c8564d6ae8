//! Multi task: a composite that runs sub-tasks sequentially.

use axum::async_trait;
use serde::Deserialize;

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::response::Envelope;

use super::{compose, single_result_index, FactoryContext, Task, TaskOutput, TaskRequest};

#[derive(Debug, Clone, Deserialize)]
pub struct MultiTaskConfig {
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,

    #[serde(default)]
    pub single_result: Option<usize>,
}

impl MultiTaskConfig {
    pub fn validate(&mut self) -> AppResult<()> {
        if self.tasks.is_empty() {
            return Err(AppError::Config(
                "multi task must have at least one task".to_string(),
            ));
        }
        self.single_result =
            single_result_index(self.single_result, self.tasks.len(), "multi task")?;
        Ok(())
    }
}

pub struct MultiTask {
    single_result: Option<usize>,
    tasks: Vec<Box<dyn Task>>,
}

pub fn factory(
    ctx: &FactoryContext,
    tc: &TaskConfig,
    ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let mut config: MultiTaskConfig = serde_json::from_value(tc.config.clone())?;
    config.validate()?;

    let mut tasks = Vec::new();
    for sub in &mut config.tasks {
        if sub.kind == "multi" {
            return Err(AppError::Config(
                "multi task does not support embedded multi tasks".to_string(),
            ));
        }

        sub.validate()?;

        let factory = ctx
            .registry
            .lookup(&sub.kind)
            .ok_or_else(|| AppError::Config(format!("task {} doesn't exist", sub.kind)))?;

        let built = factory(ctx, sub, ec)
            .map_err(|e| AppError::Config(format!("task {} returned error: {}", sub.kind, e)))?;
        tasks.extend(built);
    }

    Ok(vec![Box::new(MultiTask {
        single_result: config.single_result,
        tasks,
    })])
}

#[async_trait]
impl Task for MultiTask {
    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        let mut results = Vec::with_capacity(self.tasks.len());

        for task in &self.tasks {
            let sub = match task.run(req).await {
                TaskOutput::Envelope(envelope) => envelope,
                // a sub-task cannot take over the connection from inside a
                // composite
                TaskOutput::Response(_) => Envelope::ok()
                    .strip_status_data()
                    .error("sub-task produced a non-composable response"),
            };
            results.push(sub);
        }

        compose(results, self.single_result).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::HubPool;
    use crate::requester::Requester;
    use crate::tasks::TaskRegistry;
    use serde_json::json;
    use std::sync::Arc;

    fn build(config: serde_json::Value) -> AppResult<Vec<Box<dyn Task>>> {
        let registry = TaskRegistry::builtin();
        let pool = Arc::new(HubPool::new());
        let requester = Requester::new().unwrap();
        let ctx = FactoryContext {
            version: "test",
            registry: &registry,
            pool: &pool,
            requester: &requester,
            routes: &[],
            raw_config: &[],
        };
        let tc = TaskConfig {
            kind: "multi".to_string(),
            config,
            ..TaskConfig::default()
        };
        factory(&ctx, &tc, &EndpointConfig::default())
    }

    fn shell_sub(command: &str) -> serde_json::Value {
        json!({"type": "shell", "config": {"commands": [{"command": command}]}})
    }

    fn request() -> TaskRequest {
        TaskRequest::new(
            "GET".to_string(),
            String::new(),
            json!({"url": {}, "query": {}, "request": {"method": "GET", "body": ""}, "env": {}}),
            None,
        )
    }

    #[test]
    fn rejects_empty_task_list() {
        assert!(build(json!({"tasks": []})).is_err());
    }

    #[test]
    fn rejects_nested_multi() {
        let err = build(json!({"tasks": [{"type": "multi", "config": {"tasks": [shell_sub("echo x")]}}]}))
            .unwrap_err();
        assert!(err.to_string().contains("embedded multi"));
    }

    #[test]
    fn rejects_unknown_sub_task() {
        let err = build(json!({"tasks": [{"type": "bogus", "config": {}}]})).unwrap_err();
        assert!(err.to_string().contains("doesn't exist"));
    }

    #[test]
    fn rejects_out_of_bounds_single_result() {
        let err = build(json!({
            "tasks": [shell_sub("echo a")],
            "single_result": 1
        }))
        .unwrap_err();
        assert!(err.to_string().contains("out of bounds"));
    }

    #[tokio::test]
    async fn runs_sub_tasks_in_order() {
        let tasks = build(json!({"tasks": [shell_sub("echo a"), shell_sub("echo b")]})).unwrap();
        let TaskOutput::Envelope(envelope) = tasks[0].run(&request()).await else {
            panic!("expected envelope");
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["result"][0]["result"][0]["result"], json!("a"));
        assert_eq!(value["result"][1]["result"][0]["result"], json!("b"));
    }

    #[tokio::test]
    async fn single_result_returns_chosen_sub_envelope() {
        let tasks = build(json!({
            "tasks": [shell_sub("echo a"), shell_sub("echo b")],
            "single_result": 1
        }))
        .unwrap();
        let TaskOutput::Envelope(envelope) = tasks[0].run(&request()).await else {
            panic!("expected envelope");
        };
        let value = serde_json::to_value(&envelope).unwrap();
        // the outer result is the second sub-task's whole envelope
        assert_eq!(value["result"]["status"], json!(200));
        assert_eq!(value["result"]["result"][0]["result"], json!("b"));
    }
}
