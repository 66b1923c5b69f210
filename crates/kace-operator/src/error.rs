//! Error types for the KACE operator

use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur while reconciling resources and running pipelines
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error other than "not found"
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Inbound event or request failed validation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Remote object path would escape the local data directory
    #[error("Refusing unsafe path '{0}'")]
    UnsafePath(String),

    /// Manifest template could not be loaded or rendered
    #[error("Template error: {0}")]
    Template(String),

    /// Batch job exhausted its backoff limit
    #[error("Job {name} failed after {failed} attempts (backoff limit {backoff_limit})")]
    JobFailed {
        name: String,
        failed: i32,
        backoff_limit: i32,
    },

    /// Batch job could not be read at all while awaiting it
    #[error("Job {name} was never created in namespace {namespace}")]
    JobNeverCreated { name: String, namespace: String },

    /// Readiness retry budget exhausted
    #[error(
        "Resources for {target} not ready after {retries} retries (expected annotations {expected:?}, observed {observed:?})"
    )]
    ReadinessTimeout {
        target: String,
        retries: u32,
        expected: BTreeMap<String, String>,
        observed: BTreeMap<String, Option<BTreeMap<String, String>>>,
    },

    /// A mandatory pipeline stage failed
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    /// Data repository returned an error
    #[error("Transfer error ({status}): {message}")]
    Transfer { status: u16, message: String },

    /// Email could not be built or sent
    #[error("Email error: {0}")]
    Email(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Task queue no longer accepts work
    #[error("Task queue is closed")]
    QueueClosed,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check whether a Kubernetes error is a 404
    pub fn is_not_found(err: &kube::Error) -> bool {
        matches!(err, kube::Error::Api(ae) if ae.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn test_not_found_detection() {
        assert!(OperatorError::is_not_found(&api_error(404)));
        assert!(!OperatorError::is_not_found(&api_error(500)));
        assert!(!OperatorError::is_not_found(&api_error(409)));
    }

    #[test]
    fn test_job_errors_are_distinct() {
        let failed = OperatorError::JobFailed {
            name: "hdt-repo-main-abc".to_string(),
            failed: 4,
            backoff_limit: 4,
        };
        let never = OperatorError::JobNeverCreated {
            name: "hdt-repo-main-abc".to_string(),
            namespace: "frink".to_string(),
        };

        assert!(failed.to_string().contains("after 4 attempts"));
        assert!(never.to_string().contains("never created"));
        assert_ne!(failed.to_string(), never.to_string());
    }

    #[test]
    fn test_readiness_timeout_names_target() {
        let mut expected = BTreeMap::new();
        expected.insert("version".to_string(), "v0.0.2".to_string());
        let err = OperatorError::ReadinessTimeout {
            target: "climatekg".to_string(),
            retries: 10,
            expected,
            observed: BTreeMap::new(),
        };
        let msg = err.to_string();
        assert!(msg.contains("climatekg"));
        assert!(msg.contains("10 retries"));
        assert!(msg.contains("v0.0.2"));
    }
}
