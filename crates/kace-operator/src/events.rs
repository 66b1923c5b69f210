//! Inbound data repository events
//!
//! Payloads posted by lakeFS action hooks. A merge or commit on a branch
//! triggers a conversion; a tag plus serving parameters triggers a deployment.

use crate::config::{validate_k8s_name, validate_quantity};
use crate::error::{OperatorError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use validator::{Validate, ValidationError, ValidationErrors};

/// Default repository directory holding HDT artifacts of a release
pub const DEFAULT_HDT_PATH: &str = "/hdt/";

static REF_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$")
        .expect("ref regex pattern is invalid - this is a bug")
});

static COMMIT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9]+$").expect("commit regex pattern is invalid - this is a bug")
});

/// Branch or tag id; these become directory names on the data volume
fn validate_ref_name(value: &str) -> std::result::Result<(), ValidationError> {
    if value.len() > 255 || value.contains("..") || !REF_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_ref")
            .with_message(format!("'{}' is not a valid branch or tag name", value).into()));
    }
    Ok(())
}

fn validate_commit_id(value: &str) -> std::result::Result<(), ValidationError> {
    if value.len() > 64 || !COMMIT_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_commit")
            .with_message(format!("'{}' is not a commit id", value).into()));
    }
    Ok(())
}

fn invalid_request(errors: ValidationErrors) -> OperatorError {
    OperatorError::InvalidRequest(errors.to_string())
}

/// Post-commit / post-merge hook payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct MergeEvent {
    pub event_type: String,
    pub event_time: String,
    pub action_name: String,
    pub hook_id: String,
    #[validate(custom(function = "validate_k8s_name"))]
    pub repository_id: String,
    #[validate(custom(function = "validate_ref_name"))]
    pub branch_id: String,
    pub source_ref: String,
    #[serde(default)]
    pub commit_message: String,
    #[validate(custom(function = "validate_commit_id"))]
    pub commit_id: String,
    #[serde(default)]
    pub committer: String,
    #[serde(default)]
    pub commit_metadata: BTreeMap<String, serde_json::Value>,
}

impl MergeEvent {
    /// Minimal event for a commit on a branch
    pub fn new(
        repository_id: impl Into<String>,
        branch_id: impl Into<String>,
        commit_id: impl Into<String>,
    ) -> Self {
        let branch_id = branch_id.into();
        Self {
            event_type: "post-commit".to_string(),
            event_time: chrono::Utc::now().to_rfc3339(),
            action_name: "kace".to_string(),
            hook_id: "kace".to_string(),
            repository_id: repository_id.into(),
            source_ref: branch_id.clone(),
            branch_id,
            commit_message: String::new(),
            commit_id: commit_id.into(),
            committer: String::new(),
            commit_metadata: BTreeMap::new(),
        }
    }

    /// Reject ids that cannot name a working directory or a job
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(invalid_request)
    }
}

/// Post-create-tag hook payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TagEvent {
    pub event_type: String,
    pub event_time: String,
    pub action_name: String,
    pub hook_id: String,
    #[validate(custom(function = "validate_k8s_name"))]
    pub repository_id: String,
    pub source_ref: String,
    #[validate(custom(function = "validate_ref_name"))]
    pub tag_id: String,
    #[validate(custom(function = "validate_commit_id"))]
    pub commit_id: String,
}

impl TagEvent {
    pub fn new(
        repository_id: impl Into<String>,
        tag_id: impl Into<String>,
        commit_id: impl Into<String>,
    ) -> Self {
        let commit_id = commit_id.into();
        Self {
            event_type: "post-create-tag".to_string(),
            event_time: chrono::Utc::now().to_rfc3339(),
            action_name: "kace".to_string(),
            hook_id: "kace".to_string(),
            repository_id: repository_id.into(),
            source_ref: commit_id.clone(),
            tag_id: tag_id.into(),
            commit_id,
        }
    }
}

fn default_hdt_path() -> String {
    DEFAULT_HDT_PATH.to_string()
}

/// Request to serve a tagged release of a knowledge graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DeploymentRequest {
    #[validate(nested)]
    pub event: TagEvent,
    #[validate(custom(function = "validate_k8s_name"))]
    pub kg_name: String,
    #[validate(custom(function = "validate_quantity"))]
    pub cpu: String,
    #[validate(custom(function = "validate_quantity"))]
    pub memory: String,
    #[serde(default = "default_hdt_path")]
    pub hdt_path: String,
}

impl DeploymentRequest {
    pub fn new(
        event: TagEvent,
        kg_name: impl Into<String>,
        cpu: impl Into<String>,
        memory: impl Into<String>,
    ) -> Self {
        Self {
            event,
            kg_name: kg_name.into(),
            cpu: cpu.into(),
            memory: memory.into(),
            hdt_path: default_hdt_path(),
        }
    }

    /// Validate the request before any stage touches the cluster or disk
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(invalid_request)
    }

    /// Object prefix of the HDT artifacts under the tag, e.g. `hdt/`
    pub fn hdt_prefix(&self) -> String {
        let path = self.hdt_path.trim_start_matches('/');
        if path.is_empty() || path.ends_with('/') {
            path.to_string()
        } else {
            format!("{}/", path)
        }
    }
}
