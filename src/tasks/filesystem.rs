//! Filesystem task: serve a file or a directory listing.

use std::path::Path;

use axum::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use serde::Deserialize;

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::AppResult;
use crate::response::Envelope;
use crate::template;

use super::{FactoryContext, Task, TaskOutput, TaskRequest};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilesystemTaskConfig {
    /// File name template, joined onto `directory`.
    #[serde(default)]
    pub file: String,

    /// Output mode template; `raw` serves bytes verbatim.
    #[serde(default)]
    pub output: String,

    #[serde(default)]
    pub directory: String,

    /// Allow directory listings.
    #[serde(default)]
    pub index: bool,
}

impl FilesystemTaskConfig {
    pub fn validate(&mut self) -> AppResult<()> {
        self.file = self.file.trim().to_string();
        self.directory = self.directory.trim().to_string();
        Ok(())
    }
}

pub struct FilesystemTask {
    config: FilesystemTaskConfig,
    suffix: String,
}

pub fn factory(
    _ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let mut config: FilesystemTaskConfig = serde_json::from_value(tc.config.clone())?;
    config.validate()?;

    let mut tasks: Vec<Box<dyn Task>> = Vec::new();

    // an index endpoint with no file of its own also exposes a per-file
    // route underneath the listing
    if config.index && config.file.is_empty() {
        let mut by_name = config.clone();
        by_name.file = "{{ url.file }}".to_string();
        tasks.push(Box::new(FilesystemTask {
            config: by_name,
            suffix: "/{file}".to_string(),
        }));
    }

    tasks.insert(
        0,
        Box::new(FilesystemTask {
            config,
            suffix: String::new(),
        }),
    );
    Ok(tasks)
}

impl FilesystemTask {
    async fn serve(&self, req: &TaskRequest) -> Envelope {
        let file = match template::render(&self.config.file, &req.vars) {
            Ok(file) => file,
            Err(e) => return Envelope::new(500).error(e),
        };
        let directory = match template::render(&self.config.directory, &req.vars) {
            Ok(directory) => directory,
            Err(e) => return Envelope::new(500).error(e),
        };

        let full = Path::new(&directory).join(&file);

        let metadata = match tokio::fs::metadata(&full).await {
            Ok(metadata) => metadata,
            Err(_) => return Envelope::new(404),
        };

        if metadata.is_dir() {
            if !self.config.index {
                return Envelope::new(404);
            }
            return self.list_directory(&full).await;
        }

        let contents = match tokio::fs::read(&full).await {
            Ok(contents) => contents,
            Err(e) => return Envelope::new(500).error(e),
        };

        let output = match template::render(&self.config.output, &req.vars) {
            Ok(output) => output,
            Err(e) => return Envelope::new(500).error(e),
        };

        if output.trim().eq_ignore_ascii_case("raw") {
            return Envelope::ok().raw(contents);
        }

        let filename = full
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        Envelope::ok()
            .result(BASE64_STANDARD.encode(&contents))
            .data("filename", filename)
    }

    async fn list_directory(&self, full: &Path) -> Envelope {
        let mut reader = match tokio::fs::read_dir(full).await {
            Ok(reader) => reader,
            Err(e) => return Envelope::new(500).error(e),
        };

        let mut entries = Vec::new();
        loop {
            match reader.next_entry().await {
                Ok(Some(entry)) => {
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|kind| kind.is_dir())
                        .unwrap_or(false);
                    entries.push(
                        Envelope::ok()
                            .strip_status_data()
                            .result(entry.path().to_string_lossy().to_string())
                            .data("is_dir", is_dir),
                    );
                }
                Ok(None) => break,
                Err(e) => return Envelope::new(500).error(e),
            }
        }

        entries.sort_by(|a, b| {
            serde_json::to_string(a)
                .unwrap_or_default()
                .cmp(&serde_json::to_string(b).unwrap_or_default())
        });

        Envelope::ok().slice_result(entries)
    }
}

#[async_trait]
impl Task for FilesystemTask {
    fn path_suffix(&self) -> &str {
        &self.suffix
    }

    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        self.serve(req).await.into()
    }
}
