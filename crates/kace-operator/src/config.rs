//! Operator configuration
//!
//! Loaded from a YAML file. `${VAR}` and `${VAR:-default}` references are
//! expanded from the environment before parsing, so secrets can stay out of
//! the file.

use crate::error::{OperatorError, Result};
use crate::jobs::DEFAULT_MOUNT_PATH;
use crate::pipeline::DEPLOYMENT_SUCCEEDED_EVENT;
use crate::readiness::DEFAULT_MAX_RETRIES;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Kubernetes resource quantities (e.g. "10Gi", "500m")
static QUANTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9]+(\.[0-9]+)?(m|Ki|Mi|Gi|Ti|Pi|Ei|k|M|G|T|P|E)?$")
        .expect("quantity regex pattern is invalid - this is a bug")
});

/// RFC 1123 label
static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$")
        .expect("name regex pattern is invalid - this is a bug")
});

/// Validate a Kubernetes resource quantity string
pub(crate) fn validate_quantity(value: &str) -> std::result::Result<(), ValidationError> {
    if QUANTITY_REGEX.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_quantity")
            .with_message(format!("'{}' is not a valid Kubernetes quantity", value).into()))
    }
}

/// Validate a Kubernetes name (RFC 1123 label)
pub(crate) fn validate_k8s_name(value: &str) -> std::result::Result<(), ValidationError> {
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    Ok(SecretString::from(value))
}

fn deserialize_optional_secret<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.is_empty()).map(SecretString::from))
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct OperatorConfig {
    #[validate(nested)]
    pub kubernetes: KubernetesConfig,

    #[validate(nested)]
    pub storage: StorageConfig,

    #[validate(nested)]
    pub lakefs: LakeFsConfig,

    #[validate(nested)]
    pub notifications: NotificationConfig,

    #[validate(nested)]
    pub spider: SpiderConfig,

    #[validate(nested)]
    pub serving: ServingConfig,

    #[validate(nested)]
    pub pipeline: PipelineConfig,
}

/// Cluster placement
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Namespace for every managed resource and job
    #[validate(custom(function = "validate_k8s_name"))]
    pub namespace: String,

    /// Claim mounted by serving deployments
    #[validate(custom(function = "validate_k8s_name"))]
    pub shared_pvc_name: String,

    /// Claim mounted by batch jobs as their working directory
    #[validate(custom(function = "validate_k8s_name"))]
    pub local_pvc_name: String,

    /// Mount path of the working directory inside job containers
    #[validate(length(min = 1, message = "job_mount_path must not be empty"))]
    pub job_mount_path: String,

    /// Directory with one template sub-directory per server set
    pub templates_dir: PathBuf,

    /// Job template file
    pub job_templates: PathBuf,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            shared_pvc_name: "kace-shared-data".to_string(),
            local_pvc_name: "kace-local-data".to_string(),
            job_mount_path: DEFAULT_MOUNT_PATH.to_string(),
            templates_dir: PathBuf::from("deploy/templates"),
            job_templates: PathBuf::from("deploy/jobs.yaml"),
        }
    }
}

/// Local filesystem locations (the mounted claims)
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Mount of the local claim; job working directories live here
    pub local_data_dir: PathBuf,

    /// Mount of the shared claim; serving artifacts are staged here
    pub shared_data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_data_dir: PathBuf::from("data/local"),
            shared_data_dir: PathBuf::from("data/shared"),
        }
    }
}

/// Data repository connection
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct LakeFsConfig {
    #[validate(url(message = "lakefs.url must be a valid URL"))]
    pub url: String,

    pub access_key: String,

    #[serde(deserialize_with = "deserialize_secret")]
    pub secret_key: SecretString,

    #[validate(range(min = 1, max = 3600, message = "timeout_secs must be between 1 and 3600"))]
    pub timeout_secs: u64,
}

impl Default for LakeFsConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            access_key: String::new(),
            secret_key: SecretString::from(String::new()),
            timeout_secs: 300,
        }
    }
}

/// Notification channels
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_notifications"))]
pub struct NotificationConfig {
    /// Slack bot token; Slack delivery is off when unset
    #[serde(deserialize_with = "deserialize_optional_secret")]
    pub slack_token: Option<SecretString>,

    pub slack_channel: Option<String>,

    /// SMTP delivery; off when the section is absent
    #[validate(nested)]
    pub email: Option<EmailConfig>,

    /// Also write every event to the log
    pub log: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            slack_token: None,
            slack_channel: None,
            email: None,
            log: true,
        }
    }
}

/// SMTP connection security
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS
    #[default]
    Starttls,
    /// TLS from the first byte
    Tls,
    /// Unencrypted; only for local relays
    None,
}

/// Email notifications over SMTP
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EmailConfig {
    #[validate(length(min = 1, message = "email.smtp_host must not be empty"))]
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub security: SmtpSecurity,

    /// Login name; defaults to the sender address
    #[serde(default)]
    pub username: Option<String>,

    /// Login password; no authentication when unset
    #[serde(default, deserialize_with = "deserialize_optional_secret")]
    pub password: Option<SecretString>,

    /// Sender mailbox, e.g. `KACE <kace@example.org>`
    #[validate(length(min = 1, message = "email.from must not be empty"))]
    pub from: String,

    #[validate(length(min = 1, message = "email.recipients must not be empty"))]
    pub recipients: Vec<String>,

    /// Events that are mailed; everything else is left to the other sinks
    #[serde(default = "default_email_events")]
    pub events: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_email_events() -> Vec<String> {
    vec![DEPLOYMENT_SUCCEEDED_EVENT.to_string()]
}

impl NotificationConfig {
    pub fn slack_enabled(&self) -> bool {
        self.slack_token
            .as_ref()
            .is_some_and(|t| !t.expose_secret().is_empty())
    }
}

fn validate_notifications(config: &NotificationConfig) -> std::result::Result<(), ValidationError> {
    if config.slack_enabled()
        && config
            .slack_channel
            .as_deref()
            .map_or(true, |c| c.is_empty())
    {
        return Err(ValidationError::new("missing_slack_channel")
            .with_message("slack_channel is required when slack_token is set".into()));
    }
    Ok(())
}

/// Notarization service endpoint
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct SpiderConfig {
    pub host: String,
    pub port: u16,
}

impl SpiderConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

/// Public serving endpoint
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ServingConfig {
    /// Host name used in ingresses and access URLs
    #[validate(length(min = 1, message = "serving.host_name must not be empty"))]
    pub host_name: String,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
        }
    }
}

/// Pipeline tuning
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct PipelineConfig {
    /// Poll interval while awaiting jobs
    #[validate(range(min = 1, max = 3600))]
    pub poll_interval_secs: u64,

    /// Readiness retry budget after a deployment
    #[validate(range(min = 1, max = 64))]
    pub readiness_retries: u32,

    /// First readiness backoff delay; doubles on every retry
    #[validate(range(min = 1, max = 600))]
    pub readiness_initial_delay_secs: u64,

    /// Pipelines run concurrently by a worker
    #[validate(range(min = 1, max = 64))]
    pub workers: usize,

    /// CPU limit of the conversion job
    #[validate(custom(function = "validate_quantity"))]
    pub conversion_cpu: String,

    /// Memory limit of the conversion job
    #[validate(custom(function = "validate_quantity"))]
    pub conversion_memory: String,

    /// Environment of the conversion job
    pub conversion_env: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut conversion_env = BTreeMap::new();
        conversion_env.insert(
            "JAVA_OPTIONS".to_string(),
            "-Xmx20G -XX:+UseParallelGC".to_string(),
        );
        Self {
            poll_interval_secs: 5,
            readiness_retries: DEFAULT_MAX_RETRIES,
            readiness_initial_delay_secs: 1,
            workers: 4,
            conversion_cpu: "3".to_string(),
            conversion_memory: "20Gi".to_string(),
            conversion_env,
        }
    }
}

impl PipelineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn readiness_initial_delay(&self) -> Duration {
        Duration::from_secs(self.readiness_initial_delay_secs)
    }
}

impl OperatorConfig {
    /// Load, expand and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OperatorError::InvalidConfig(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| OperatorError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Run field validation, reporting every failing field
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| OperatorError::InvalidConfig(e.to_string()))
    }

    /// Template directory of a server set
    pub fn set_templates_dir(&self, set: &str) -> PathBuf {
        self.kubernetes.templates_dir.join(set)
    }
}

/// Expand `${VAR}` and `${VAR:-default}`; unset variables without a default
/// expand to the empty string
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}
