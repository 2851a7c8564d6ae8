//! Shell task: run configured commands and format their stdout.

use std::collections::HashMap;

use axum::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::formats;
use crate::response::Envelope;
use crate::template;

use super::{compose, single_result_index, FactoryContext, Task, TaskOutput, TaskRequest};

const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Deserialize)]
pub struct ShellTaskConfig {
    /// Extra environment variables for every command.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default = "ShellTaskConfig::default_shell")]
    pub shell: String,

    #[serde(default)]
    pub commands: Vec<ShellCommand>,

    #[serde(default)]
    pub single_result: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShellCommand {
    pub command: String,

    #[serde(default)]
    pub chdir: String,

    #[serde(default)]
    pub format: String,

    /// Echo the rendered command line back in the sub-result.
    #[serde(default)]
    pub return_command: bool,
}

impl ShellTaskConfig {
    fn default_shell() -> String {
        DEFAULT_SHELL.to_string()
    }

    pub fn validate(&mut self) -> AppResult<()> {
        if self.commands.is_empty() {
            return Err(AppError::Config(
                "shell task needs at least one command".to_string(),
            ));
        }
        for command in &mut self.commands {
            command.format = formats::verify(&command.format)?;
        }
        self.single_result =
            single_result_index(self.single_result, self.commands.len(), "shell task")?;
        Ok(())
    }
}

pub struct ShellTask {
    config: ShellTaskConfig,
}

pub fn factory(
    _ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let mut config: ShellTaskConfig = serde_json::from_value(tc.config.clone())?;
    config.validate()?;
    Ok(vec![Box::new(ShellTask { config })])
}

impl ShellTask {
    /// Run one command; every outcome lands in the sub-envelope.
    async fn run_command(&self, command: &ShellCommand, req: &TaskRequest) -> Envelope {
        let mut sub = Envelope::ok().strip_status_data();

        let rendered = match template::render(&command.command, &req.vars) {
            Ok(rendered) => rendered,
            Err(e) => return sub.error(e),
        };

        if command.return_command {
            sub = sub.data("command", &rendered);
        }

        let mut process = Command::new(&self.config.shell);
        process.arg("-c").arg(&rendered);
        if !command.chdir.is_empty() {
            process.current_dir(&command.chdir);
        }
        for (key, value) in &self.config.env {
            process.env(key, value);
        }

        let output = match process.output().await {
            Ok(output) => output,
            Err(e) => return sub.error(e),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return sub.error(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match formats::format(stdout.trim(), &command.format) {
            Ok((value, format)) => sub.result(value).data("format", format),
            Err(e) => sub.error(e),
        }
    }
}

#[async_trait]
impl Task for ShellTask {
    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        let mut results = Vec::with_capacity(self.config.commands.len());

        for command in &self.config.commands {
            results.push(self.run_command(command, req).await);
        }

        compose(results, self.config.single_result).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> TaskRequest {
        TaskRequest::new(
            "GET".to_string(),
            String::new(),
            json!({"url": {}, "query": {"name": "world"}, "request": {"method": "GET", "body": ""}, "env": {}}),
            None,
        )
    }

    fn config(commands: Vec<ShellCommand>) -> ShellTaskConfig {
        let mut config = ShellTaskConfig {
            env: HashMap::new(),
            shell: DEFAULT_SHELL.to_string(),
            commands,
            single_result: None,
        };
        config.validate().unwrap();
        config
    }

    fn command(line: &str) -> ShellCommand {
        ShellCommand {
            command: line.to_string(),
            chdir: String::new(),
            format: String::new(),
            return_command: false,
        }
    }

    #[test]
    fn validate_requires_commands() {
        let mut empty = ShellTaskConfig {
            env: HashMap::new(),
            shell: DEFAULT_SHELL.to_string(),
            commands: vec![],
            single_result: None,
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_bounds_single_result() {
        let mut config = ShellTaskConfig {
            env: HashMap::new(),
            shell: DEFAULT_SHELL.to_string(),
            commands: vec![command("echo hi")],
            single_result: Some(1),
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn echo_returns_text_result() {
        let task = ShellTask {
            config: config(vec![command("echo hi")]),
        };

        let TaskOutput::Envelope(envelope) = task.run(&request()).await else {
            panic!("expected envelope");
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "status": 200,
                "message": "OK",
                "result": [{"result": "hi", "format": "text"}]
            })
        );
    }

    #[tokio::test]
    async fn command_is_rendered_over_vars() {
        let mut cmd = command("echo {{ query.name }}");
        cmd.return_command = true;
        let task = ShellTask {
            config: config(vec![cmd]),
        };

        let TaskOutput::Envelope(envelope) = task.run(&request()).await else {
            panic!("expected envelope");
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["result"][0]["result"], json!("world"));
        assert_eq!(value["result"][0]["command"], json!("echo world"));
    }

    #[tokio::test]
    async fn failing_command_yields_error_sub_result() {
        let task = ShellTask {
            config: config(vec![command("exit 3"), command("echo ok")]),
        };

        let TaskOutput::Envelope(envelope) = task.run(&request()).await else {
            panic!("expected envelope");
        };
        let value = serde_json::to_value(&envelope).unwrap();
        // one sub-envelope per command, error or result
        assert!(value["result"][0]["error"].is_string());
        assert_eq!(value["result"][1]["result"], json!("ok"));
        assert_eq!(value["status"], json!(200));
    }

    #[tokio::test]
    async fn single_result_picks_one_sub_response() {
        let mut config = config(vec![command("echo a"), command("echo b")]);
        config.single_result = Some(1);
        let task = ShellTask { config };

        let TaskOutput::Envelope(envelope) = task.run(&request()).await else {
            panic!("expected envelope");
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["result"]["result"], json!("b"));
    }

    #[tokio::test]
    async fn json_format_parses_stdout() {
        let mut cmd = command("echo '{\"a\": 1}'");
        cmd.format = "json".to_string();
        let task = ShellTask {
            config: config(vec![cmd]),
        };

        let TaskOutput::Envelope(envelope) = task.run(&request()).await else {
            panic!("expected envelope");
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["result"][0]["result"], json!({"a": 1}));
        assert_eq!(value["result"][0]["format"], json!("json"));
    }
}
