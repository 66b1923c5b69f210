//! Job Controller
//!
//! Submits one-shot batch jobs built from per-type templates and polls them to
//! a terminal state. Every submit removes a previous job of the same name
//! first, so at most one job with a given name exists in the namespace.
//!
//! None of the poll loops has an upper bound. A cluster that never finishes
//! deleting a job blocks [`JobController::remove`] forever; callers that need a
//! deadline have to impose it from outside.

use crate::clock::Sleeper;
use crate::cluster::ClusterApi;
use crate::error::{OperatorError, Result};
use crate::reconciler::ResourceAllocation;
use k8s_openapi::api::batch::v1::{Job, JobSpec as K8sJobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Backoff limit Kubernetes applies when a job does not set one
pub const DEFAULT_BACKOFF_LIMIT: i32 = 6;

/// Name of the working-directory volume every job mounts
pub const DATA_VOLUME: &str = "data";

/// Default mount path of the working-directory volume
pub const DEFAULT_MOUNT_PATH: &str = "/mnt/repo";

/// Default poll interval for [`JobController::await_completion`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Poll interval of the deletion loops
const DELETION_POLL_INTERVAL: Duration = Duration::from_secs(1);

const MAX_NAME_LEN: usize = 63;

/// Template for one job type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub backoff_limit: Option<i32>,
}

/// Base batch jobs keyed by job type, built once at startup
#[derive(Debug, Clone)]
pub struct JobTemplateRegistry {
    templates: BTreeMap<String, JobTemplate>,
    jobs: BTreeMap<String, Job>,
}

impl JobTemplateRegistry {
    /// Build the registry; `data_pvc` is the claim backing the `data` volume
    pub fn new(templates: BTreeMap<String, JobTemplate>, data_pvc: &str) -> Self {
        let jobs = templates
            .iter()
            .map(|(job_type, template)| {
                (job_type.clone(), build_base_job(job_type, template, data_pvc))
            })
            .collect();
        Self { templates, jobs }
    }

    /// Load a `jobType -> {image, command, backoffLimit}` YAML file
    pub fn load(path: impl AsRef<Path>, data_pvc: &str) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OperatorError::InvalidConfig(format!(
                "cannot read job templates {}: {}",
                path.display(),
                e
            ))
        })?;
        let templates: BTreeMap<String, JobTemplate> = serde_yaml::from_str(&content)?;
        info!(path = %path.display(), job_types = ?templates.keys().collect::<Vec<_>>(), "Loaded job templates");
        Ok(Self::new(templates, data_pvc))
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn template(&self, job_type: &str) -> Option<&JobTemplate> {
        self.templates.get(job_type)
    }

    /// A fresh copy of the base job for a type
    pub fn base_job(&self, job_type: &str) -> Result<Job> {
        self.jobs
            .get(job_type)
            .cloned()
            .ok_or_else(|| OperatorError::InvalidConfig(format!("unknown job type '{}'", job_type)))
    }
}

fn build_base_job(job_type: &str, template: &JobTemplate, data_pvc: &str) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(job_type.to_string()),
            ..Default::default()
        },
        spec: Some(K8sJobSpec {
            backoff_limit: template.backoff_limit,
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: job_type.to_string(),
                        image: Some(template.image.clone()),
                        command: (!template.command.is_empty()).then(|| template.command.clone()),
                        tty: Some(true),
                        stdin: Some(true),
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".to_string()),
                    volumes: Some(vec![Volume {
                        name: DATA_VOLUME.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: data_pvc.to_string(),
                            read_only: None,
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Where in the shared data volume a job works
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeContext {
    pub repo: String,
    pub branch: String,
}

impl VolumeContext {
    pub fn new(repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    pub fn sub_path(&self) -> String {
        format!("{}/{}", self.repo, self.branch)
    }
}

/// One job invocation: a job type plus per-run overrides
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobSpec {
    pub job_type: String,
    pub job_name: String,
    pub image: Option<String>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
    pub volume_mounts: Vec<VolumeMount>,
    pub resources: Option<ResourceAllocation>,
    pub backoff_limit: Option<i32>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env_vars: BTreeMap<String, String>) -> Self {
        self.env_vars = env_vars;
        self
    }

    pub fn with_resources(mut self, resources: ResourceAllocation) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn with_backoff_limit(mut self, limit: i32) -> Self {
        self.backoff_limit = Some(limit);
        self
    }
}

/// Observed phase of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobPhase::Pending => write!(f, "Pending"),
            JobPhase::Running => write!(f, "Running"),
            JobPhase::Succeeded => write!(f, "Succeeded"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Read-only view of a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun {
    pub name: String,
    pub succeeded: i32,
    pub failed: i32,
    pub active: i32,
    pub backoff_limit: i32,
    pub deletion_requested: bool,
}

impl JobRun {
    pub fn from_job(job: &Job) -> Self {
        let status = job.status.as_ref();
        Self {
            name: job.metadata.name.clone().unwrap_or_default(),
            succeeded: status.and_then(|s| s.succeeded).unwrap_or(0),
            failed: status.and_then(|s| s.failed).unwrap_or(0),
            active: status.and_then(|s| s.active).unwrap_or(0),
            backoff_limit: job
                .spec
                .as_ref()
                .and_then(|s| s.backoff_limit)
                .unwrap_or(DEFAULT_BACKOFF_LIMIT),
            deletion_requested: job.metadata.deletion_timestamp.is_some(),
        }
    }

    /// Success wins over failure counts
    pub fn phase(&self) -> JobPhase {
        if self.succeeded > 0 {
            JobPhase::Succeeded
        } else if self.failed >= self.backoff_limit {
            JobPhase::Failed
        } else if self.active > 0 {
            JobPhase::Running
        } else {
            JobPhase::Pending
        }
    }
}

/// Build an RFC-1123 job name `{prefix}-{parts..}-{commit[..10]}`
pub fn job_name(prefix: &str, parts: &[&str], commit: &str) -> String {
    let commit: String = commit.chars().take(10).collect();
    let raw = std::iter::once(prefix)
        .chain(parts.iter().copied())
        .chain(std::iter::once(commit.as_str()))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    sanitize_name(&raw)
}

/// Lower-case, map everything outside `[a-z0-9-]` to `-`, cap at 63 chars
pub fn sanitize_name(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(MAX_NAME_LEN)
        .collect();
    mapped.trim_matches('-').to_string()
}

#[derive(Clone)]
struct JobMetrics {
    submitted: metrics::Counter,
    failed: metrics::Counter,
}

impl JobMetrics {
    fn new() -> Self {
        Self {
            submitted: metrics::counter!("kace_jobs_submitted_total"),
            failed: metrics::counter!("kace_job_failures_total"),
        }
    }
}

/// Submits, awaits and removes batch jobs in one namespace
#[derive(Clone)]
pub struct JobController {
    namespace: String,
    mount_path: String,
    cluster: Arc<dyn ClusterApi>,
    registry: Arc<JobTemplateRegistry>,
    sleeper: Arc<dyn Sleeper>,
    metrics: JobMetrics,
}

impl JobController {
    pub fn new(
        namespace: impl Into<String>,
        cluster: Arc<dyn ClusterApi>,
        registry: Arc<JobTemplateRegistry>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            cluster,
            registry,
            sleeper,
            metrics: JobMetrics::new(),
        }
    }

    pub fn with_mount_path(mut self, mount_path: impl Into<String>) -> Self {
        self.mount_path = mount_path.into();
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Mount path of the working-directory volume inside job containers
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Build the job body for a spec without submitting it
    pub fn build_job(&self, spec: &JobSpec, volume: &VolumeContext) -> Result<Job> {
        let mut job = self.registry.base_job(&spec.job_type)?;

        job.metadata.name = Some(spec.job_name.clone());
        job.metadata.namespace = Some(self.namespace.clone());
        let labels = job.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(
            "app.kubernetes.io/managed-by".to_string(),
            "kace-operator".to_string(),
        );
        labels.insert("kace/job-type".to_string(), spec.job_type.clone());

        let job_spec = job
            .spec
            .as_mut()
            .ok_or_else(|| OperatorError::Internal("base job without spec".to_string()))?;
        if spec.backoff_limit.is_some() {
            job_spec.backoff_limit = spec.backoff_limit;
        }
        let container = job_spec
            .template
            .spec
            .as_mut()
            .and_then(|p| p.containers.first_mut())
            .ok_or_else(|| OperatorError::Internal("base job without container".to_string()))?;

        if let Some(image) = &spec.image {
            container.image = Some(image.clone());
        }
        if !spec.command.is_empty() {
            container.command = Some(spec.command.clone());
        }
        if !spec.args.is_empty() {
            container.args = Some(spec.args.clone());
        }
        if let Some(resources) = spec.resources.as_ref().filter(|r| !r.is_empty()) {
            container.resources = Some(resources.to_requirements());
        }
        if !spec.env_vars.is_empty() {
            container.env = Some(
                spec.env_vars
                    .iter()
                    .map(|(name, value)| EnvVar {
                        name: name.clone(),
                        value: Some(value.clone()),
                        value_from: None,
                    })
                    .collect(),
            );
        }

        let mut mounts = vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: self.mount_path.clone(),
            sub_path: Some(volume.sub_path()),
            ..Default::default()
        }];
        mounts.extend(spec.volume_mounts.iter().cloned());
        container.volume_mounts = Some(mounts);

        Ok(job)
    }

    /// Remove any job of the same name, then create this one
    #[instrument(skip(self, spec), fields(job = %spec.job_name, job_type = %spec.job_type))]
    pub async fn submit(&self, spec: &JobSpec, volume: &VolumeContext) -> Result<()> {
        let job = self.build_job(spec, volume)?;

        info!(repo = %volume.repo, branch = %volume.branch, "Removing previous job before submit");
        self.remove(&spec.job_name).await?;

        self.cluster.create_job(&self.namespace, &job).await?;
        self.metrics.submitted.increment(1);
        info!(args = ?spec.args, "Job submitted");
        Ok(())
    }

    /// Poll a job until it succeeds or exhausts its backoff limit
    #[instrument(skip(self))]
    pub async fn await_completion(&self, job_name: &str, poll_interval: Duration) -> Result<JobRun> {
        loop {
            let job = self
                .cluster
                .get_job(&self.namespace, job_name)
                .await?
                .ok_or_else(|| OperatorError::JobNeverCreated {
                    name: job_name.to_string(),
                    namespace: self.namespace.clone(),
                })?;

            let run = JobRun::from_job(&job);
            match run.phase() {
                JobPhase::Succeeded => {
                    info!(succeeded = run.succeeded, failed = run.failed, "Job succeeded");
                    return Ok(run);
                }
                JobPhase::Failed => {
                    self.metrics.failed.increment(1);
                    warn!(failed = run.failed, backoff_limit = run.backoff_limit, "Job failed");
                    return Err(OperatorError::JobFailed {
                        name: run.name,
                        failed: run.failed,
                        backoff_limit: run.backoff_limit,
                    });
                }
                phase => {
                    debug!(%phase, active = run.active, failed = run.failed, "Job not finished");
                    self.sleeper.sleep(poll_interval).await;
                }
            }
        }
    }

    /// Delete a job and wait until it is gone, then clean up its pods
    #[instrument(skip(self))]
    pub async fn remove(&self, job_name: &str) -> Result<()> {
        loop {
            match self.cluster.get_job(&self.namespace, job_name).await? {
                None => {
                    debug!("Job absent");
                    break;
                }
                Some(job) if job.metadata.deletion_timestamp.is_some() => {
                    debug!("Job is being deleted");
                }
                Some(_) => {
                    info!("Issuing job deletion");
                    self.cluster.delete_job(&self.namespace, job_name).await?;
                }
            }
            self.sleeper.sleep(DELETION_POLL_INTERVAL).await;
        }

        self.remove_pods(job_name).await;
        Ok(())
    }

    /// Submit and await a job
    pub async fn run_to_completion(
        &self,
        spec: &JobSpec,
        volume: &VolumeContext,
        poll_interval: Duration,
    ) -> Result<JobRun> {
        self.submit(spec, volume).await?;
        self.await_completion(&spec.job_name, poll_interval).await
    }

    async fn remove_pods(&self, job_name: &str) {
        let pods = match self.cluster.list_job_pods(&self.namespace, job_name).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "Failed to list job pods, skipping pod cleanup");
                return;
            }
        };
        for pod in pods {
            self.remove_pod_with_wait(&pod).await;
        }
    }

    async fn remove_pod_with_wait(&self, pod_name: &str) {
        loop {
            match self.cluster.get_pod(&self.namespace, pod_name).await {
                Ok(None) => {
                    debug!(pod = %pod_name, "Pod removed");
                    return;
                }
                Ok(Some(pod)) if pod.metadata.deletion_timestamp.is_some() => {
                    debug!(pod = %pod_name, "Pod is being deleted");
                }
                Ok(Some(_)) => {
                    if let Err(e) = self.cluster.delete_pod(&self.namespace, pod_name).await {
                        warn!(pod = %pod_name, error = %e, "Failed to delete pod, skipping");
                        return;
                    }
                }
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "Failed to read pod, skipping");
                    return;
                }
            }
            self.sleeper.sleep(DELETION_POLL_INTERVAL).await;
        }
    }
}

impl fmt::Debug for JobController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobController")
            .field("namespace", &self.namespace)
            .field("mount_path", &self.mount_path)
            .finish()
    }
}
