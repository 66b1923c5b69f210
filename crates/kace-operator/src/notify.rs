//! Notification Gateway
//!
//! Delivers pipeline events to human-facing channels. Delivery is
//! fire-and-forget: [`NotificationGateway::notify`] never fails, a sink that
//! errors is logged and skipped.

use crate::config::{EmailConfig, NotificationConfig, SmtpSecurity};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use minijinja::{context, Environment};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Event name of the failure notification sent by the stage interceptor
pub const STAGE_FAILED_EVENT: &str = "Pipeline stage failed";

const DEFAULT_SLACK_URL: &str = "https://slack.com/api";

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

const DEPLOYED_MAIL: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>Service Deployment Successful</title></head>
<body>
<h3>Service Deployment Successful</h3>
<p>Your knowledge graph has been deployed and is now operational.</p>
<p><strong>Service Name:</strong> {{ kg_name }}</p>
<p><strong>Version:</strong> {{ version }}</p>
<p><strong>Access URL:</strong> <a href="{{ access_url }}">{{ access_url }}</a></p>
</body>
</html>
"#;

const EVENT_MAIL: &str = r#"<!DOCTYPE html>
<html>
<head><meta charset="UTF-8"><title>{{ event }}</title></head>
<body>
<p>An event occurred: {{ event }}</p>
<ul>
{% for key, value in details|items %}
<li><strong>{{ key }}</strong>: {{ value }}</li>
{% endfor %}
</ul>
</body>
</html>
"#;

/// Structured context attached to an event
pub type NotificationContext = BTreeMap<String, serde_json::Value>;

/// A channel that can deliver events
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, event: &str, context: &NotificationContext) -> Result<()>;
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Chat message body: the event line followed by one quoted line per key
pub fn format_message(event: &str, context: &NotificationContext) -> String {
    let mut message = format!("*Event Triggered*: {}\n", event);
    for (key, value) in context {
        message.push_str(&format!("> *{}*: {}\n", key, display_value(value)));
    }
    message
}

/// Builder for [`SlackNotifier`]
#[derive(Debug, Default)]
pub struct SlackNotifierBuilder {
    token: Option<SecretString>,
    channel: Option<String>,
    base_url: Option<String>,
    timeout: Option<Duration>,
}

impl SlackNotifierBuilder {
    /// Bot token (required)
    pub fn token(mut self, token: SecretString) -> Self {
        self.token = Some(token);
        self
    }

    /// Channel id (required)
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Override the Slack API base URL
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<SlackNotifier> {
        let token = self
            .token
            .ok_or_else(|| OperatorError::InvalidConfig("slack token is required".to_string()))?;
        if token.expose_secret().is_empty() {
            return Err(OperatorError::InvalidConfig(
                "slack token must not be empty".to_string(),
            ));
        }
        let channel = self
            .channel
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OperatorError::InvalidConfig("slack channel is required".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout.unwrap_or(Duration::from_secs(10)))
            .build()?;

        Ok(SlackNotifier {
            token,
            channel,
            base_url: self
                .base_url
                .unwrap_or_else(|| DEFAULT_SLACK_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            client,
        })
    }
}

#[derive(Serialize)]
struct PostMessage<'a> {
    channel: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Posts events to a Slack channel through `chat.postMessage`
pub struct SlackNotifier {
    token: SecretString,
    channel: String,
    base_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn builder() -> SlackNotifierBuilder {
        SlackNotifierBuilder::default()
    }
}

impl std::fmt::Debug for SlackNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackNotifier")
            .field("channel", &self.channel)
            .field("base_url", &self.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl NotificationSink for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn notify(&self, event: &str, context: &NotificationContext) -> Result<()> {
        let text = format_message(event, context);
        let url = format!("{}/chat.postMessage", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.token.expose_secret())
            .json(&PostMessage {
                channel: &self.channel,
                text: &text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OperatorError::Transfer {
                status: status.as_u16(),
                message: format!("slack returned {}", status),
            });
        }
        let body: SlackResponse = response.json().await?;
        if !body.ok {
            return Err(OperatorError::Transfer {
                status: status.as_u16(),
                message: body.error.unwrap_or_else(|| "unknown slack error".to_string()),
            });
        }
        debug!(channel = %self.channel, event = %event, "Slack message sent");
        Ok(())
    }
}

/// Subject and HTML body of a mailed event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
}

fn render_mail(name: &str, source: &str, values: minijinja::Value) -> Result<String> {
    // the `.html` name turns on HTML escaping
    let mut env = Environment::new();
    env.add_template(name, source)
        .and_then(|_| env.get_template(name)?.render(values))
        .map_err(|e| OperatorError::Template(format!("{}: {:#}", name, e)))
}

/// Mail for an event: a deployment announcement when the context carries the
/// graph name, version and access URL, otherwise a listing of the context
pub fn email_content(event: &str, context: &NotificationContext) -> Result<EmailContent> {
    let field = |key: &str| context.get(key).map(display_value);
    if let (Some(kg_name), Some(version), Some(access_url)) =
        (field("kg_name"), field("version"), field("access_url"))
    {
        let body = render_mail(
            "deployed.html",
            DEPLOYED_MAIL,
            context! { kg_name => &kg_name, version => &version, access_url => access_url },
        )?;
        return Ok(EmailContent {
            subject: format!("No-reply -- {} {} has been deployed", kg_name, version),
            body,
        });
    }

    let details: BTreeMap<&str, String> = context
        .iter()
        .map(|(key, value)| (key.as_str(), display_value(value)))
        .collect();
    let body = render_mail("event.html", EVENT_MAIL, context! { event => event, details => details })?;
    Ok(EmailContent {
        subject: format!("Notification: {}", event),
        body,
    })
}

fn email_error(err: impl std::fmt::Display) -> OperatorError {
    OperatorError::Email(err.to_string())
}

fn parse_mailbox(value: &str) -> Result<Mailbox> {
    value
        .parse()
        .map_err(|e| OperatorError::InvalidConfig(format!("invalid email address '{}': {}", value, e)))
}

/// Mails subscribed events to a fixed recipient list over SMTP
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
    port: u16,
    from: Mailbox,
    recipients: Vec<Mailbox>,
    events: BTreeSet<String>,
}

impl EmailNotifier {
    pub fn from_config(config: &EmailConfig) -> Result<Self> {
        let from = parse_mailbox(&config.from)?;
        let recipients = config
            .recipients
            .iter()
            .map(|r| parse_mailbox(r))
            .collect::<Result<Vec<_>>>()?;
        if recipients.is_empty() {
            return Err(OperatorError::InvalidConfig(
                "email recipients must not be empty".to_string(),
            ));
        }

        let builder = match config.security {
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                    .map_err(email_error)?
            }
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp_host)
                .map_err(email_error)?,
            SmtpSecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.smtp_host.as_str())
            }
        };
        let mut builder = builder.port(config.smtp_port).timeout(Some(SMTP_TIMEOUT));
        if let Some(password) = &config.password {
            let username = config
                .username
                .clone()
                .unwrap_or_else(|| from.email.to_string());
            builder = builder.credentials(Credentials::new(
                username,
                password.expose_secret().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            from,
            recipients,
            events: config.events.iter().cloned().collect(),
        })
    }

    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.contains(event)
    }

    /// Build the message for an event without sending it
    pub fn message(&self, event: &str, context: &NotificationContext) -> Result<Message> {
        let content = email_content(event, context)?;
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(content.subject)
            .header(ContentType::TEXT_HTML);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        builder.body(content.body).map_err(email_error)
    }
}

impl std::fmt::Debug for EmailNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailNotifier")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("from", &self.from.to_string())
            .field("recipients", &self.recipients.len())
            .field("events", &self.events)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl NotificationSink for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, event: &str, context: &NotificationContext) -> Result<()> {
        if !self.subscribes_to(event) {
            debug!(event = %event, "Event not mailed");
            return Ok(());
        }
        let message = self.message(event, context)?;
        self.transport.send(message).await.map_err(email_error)?;
        info!(event = %event, recipients = self.recipients.len(), "Email sent");
        Ok(())
    }
}

/// Writes events to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, event: &str, context: &NotificationContext) -> Result<()> {
        let fields = serde_json::to_string(context)?;
        info!(event = %event, context = %fields, "Notification");
        Ok(())
    }
}

/// Fans events out to every configured sink
#[derive(Clone, Default)]
pub struct NotificationGateway {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Gateway with the sinks enabled in configuration
    pub fn from_config(config: &NotificationConfig) -> Result<Self> {
        let mut gateway = Self::new();
        if config.log {
            gateway = gateway.with_sink(Arc::new(LogNotifier));
        }
        if let (Some(token), Some(channel)) = (config.slack_token.clone(), config.slack_channel.clone())
        {
            if config.slack_enabled() {
                let slack = SlackNotifier::builder().token(token).channel(channel).build()?;
                gateway = gateway.with_sink(Arc::new(slack));
            }
        }
        if let Some(email) = &config.email {
            gateway = gateway.with_sink(Arc::new(EmailNotifier::from_config(email)?));
        }
        if gateway.sinks.is_empty() {
            warn!("No notification sinks configured, events will be dropped");
        }
        Ok(gateway)
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver to all sinks; failures are logged, never returned
    pub async fn notify(&self, event: &str, context: &NotificationContext) {
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event, context).await {
                warn!(sink = sink.name(), event = %event, error = %e, "Notification delivery failed");
                metrics::counter!("kace_notification_failures_total", "sink" => sink.name().to_string())
                    .increment(1);
            }
        }
    }
}

impl std::fmt::Debug for NotificationGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationGateway")
            .field("sinks", &self.sink_names())
            .finish()
    }
}
