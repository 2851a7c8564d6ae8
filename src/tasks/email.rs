//! Email task: render subject/body templates and send via SMTP.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use axum::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::config::{EndpointConfig, TaskConfig};
use crate::error::{AppError, AppResult};
use crate::response::Envelope;
use crate::template;

use super::{FactoryContext, Task, TaskOutput, TaskRequest};

const CONNECT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct EmailSmtpConfig {
    #[serde(default = "EmailSmtpConfig::default_host")]
    pub host: String,

    #[serde(default = "EmailSmtpConfig::default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,
}

impl EmailSmtpConfig {
    fn default_host() -> String {
        "localhost".to_string()
    }

    const fn default_port() -> u16 {
        25
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.host.trim().is_empty() {
            return Err(AppError::Config("invalid smtp host".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailTaskConfig {
    #[serde(default)]
    pub smtp: Option<EmailSmtpConfig>,

    #[serde(default)]
    pub sender: String,

    #[serde(default)]
    pub recipients: Vec<String>,

    /// Static template data, overridden by the request bundle.
    #[serde(default)]
    pub data: Map<String, Value>,

    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub body: String,

    #[serde(default)]
    pub body_filename: String,

    /// Render the message into an HTML page instead of sending it.
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub html: bool,

    #[serde(default)]
    pub disable_connect_check: bool,

    #[serde(skip)]
    body_template: String,
}

impl EmailTaskConfig {
    pub fn validate(&mut self) -> AppResult<()> {
        if !self.debug {
            let smtp = self
                .smtp
                .as_ref()
                .ok_or_else(|| AppError::Config("missing smtp".to_string()))?;
            smtp.validate()?;
        }

        self.sender = self.sender.trim().to_string();
        if self.sender.is_empty() {
            return Err(AppError::Config("invalid sender".to_string()));
        }
        self.sender
            .parse::<Mailbox>()
            .map_err(|e| AppError::Config(format!("invalid sender: {}", e)))?;

        if !self.debug {
            if self.recipients.is_empty() {
                return Err(AppError::Config("missing recipients".to_string()));
            }
            for recipient in &self.recipients {
                if recipient.trim().is_empty() {
                    return Err(AppError::Config("invalid recipient".to_string()));
                }
                recipient
                    .parse::<Mailbox>()
                    .map_err(|_| AppError::Config(format!("invalid recipient: {}", recipient)))?;
            }
        }

        self.subject = self.subject.trim().to_string();
        if self.subject.is_empty() {
            return Err(AppError::Config("empty subject".to_string()));
        }
        template::verify(&self.subject)?;

        self.body_template = if !self.body_filename.is_empty() {
            std::fs::read_to_string(&self.body_filename).map_err(|e| {
                AppError::Config(format!(
                    "cannot read template file {}: {}",
                    self.body_filename, e
                ))
            })?
        } else {
            if self.body.is_empty() {
                return Err(AppError::Config(
                    "please provide either body or body_filename".to_string(),
                ));
            }
            self.body.clone()
        };
        template::verify(&self.body_template)?;

        Ok(())
    }

    /// Best-effort reachability probe of the SMTP host at startup.
    fn probe(&self) -> AppResult<()> {
        let Some(smtp) = &self.smtp else {
            return Ok(());
        };
        let address = (smtp.host.as_str(), smtp.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| AppError::Config(format!("cannot resolve smtp host {}", smtp.host)))?;
        TcpStream::connect_timeout(&address, CONNECT_PROBE_TIMEOUT)?;
        Ok(())
    }
}

pub struct EmailTask {
    config: EmailTaskConfig,
}

pub fn factory(
    _ctx: &FactoryContext,
    tc: &TaskConfig,
    _ec: &EndpointConfig,
) -> AppResult<Vec<Box<dyn Task>>> {
    let mut config: EmailTaskConfig = serde_json::from_value(tc.config.clone())?;
    config.validate()?;

    if !config.debug && !config.disable_connect_check {
        config
            .probe()
            .map_err(|e| AppError::Config(format!("smtp connect check failed: {}", e)))?;
    }

    Ok(vec![Box::new(EmailTask { config })])
}

impl EmailTask {
    /// Config data merged with the request bundle; the bundle wins.
    fn template_data(&self, req: &TaskRequest) -> Value {
        let mut data = self.config.data.clone();
        if let Value::Object(vars) = &req.vars {
            for (key, value) in vars {
                data.insert(key.clone(), value.clone());
            }
        }
        Value::Object(data)
    }

    fn build_message(&self, subject: &str, body: &str) -> AppResult<Message> {
        let sender: Mailbox = self
            .config
            .sender
            .parse()
            .map_err(|e| AppError::Task(format!("sender: {}", e)))?;

        let mut builder = Message::builder().from(sender).subject(subject);
        for recipient in &self.config.recipients {
            let mailbox: Mailbox = recipient
                .parse()
                .map_err(|e| AppError::Task(format!("recipient: {}", e)))?;
            builder = builder.to(mailbox);
        }

        let content_type = if self.config.html {
            ContentType::TEXT_HTML
        } else {
            ContentType::TEXT_PLAIN
        };

        builder
            .header(content_type)
            .body(body.to_string())
            .map_err(|e| AppError::Task(format!("message: {}", e)))
    }

    async fn send(&self, message: Message) -> AppResult<()> {
        let smtp = self
            .config
            .smtp
            .as_ref()
            .ok_or_else(|| AppError::Task("missing smtp".to_string()))?;

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host).port(smtp.port);
        if !smtp.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                smtp.username.clone(),
                smtp.password.clone(),
            ));
        }

        builder
            .build()
            .send(message)
            .await
            .map_err(|e| AppError::Task(format!("smtp: {}", e)))?;
        Ok(())
    }

    fn debug_page(data: &Value, message: &Message) -> String {
        let pretty = serde_json::to_string_pretty(data).unwrap_or_default();
        let formatted = String::from_utf8_lossy(&message.formatted()).to_string();
        format!(
            "<html><body><h1>email debug</h1><h2>data</h2><pre>{}</pre>\
             <h2>message</h2><pre>{}</pre></body></html>",
            html_escape(&pretty),
            html_escape(&formatted),
        )
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[async_trait]
impl Task for EmailTask {
    async fn run(&self, req: &TaskRequest) -> TaskOutput {
        let data = self.template_data(req);

        let subject = match template::render(&self.config.subject, &data) {
            Ok(subject) => subject,
            Err(e) => return TaskOutput::Envelope(Envelope::ok().error(e)),
        };
        let body = match template::render(&self.config.body_template, &data) {
            Ok(body) => body,
            Err(e) => return TaskOutput::Envelope(Envelope::ok().error(e)),
        };

        let message = match self.build_message(&subject, &body) {
            Ok(message) => message,
            Err(e) => return TaskOutput::Envelope(Envelope::ok().error(e)),
        };

        if self.config.debug {
            return TaskOutput::Envelope(Envelope::ok().html(Self::debug_page(&data, &message)));
        }

        match self.send(message).await {
            Ok(()) => Envelope::ok().into(),
            Err(e) => Envelope::ok().error(e).into(),
        }
    }
}
