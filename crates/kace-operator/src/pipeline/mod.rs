//! Pipeline Orchestrator
//!
//! Sequences the reconciler, job controller and readiness waiter into the
//! conversion and deployment workflows. Stages within a run execute strictly
//! in order; every stage goes through the [`StageRunner`] interceptor.

mod conversion;
mod deployment;
pub mod run;
pub mod stage;

pub use conversion::{
    CONVERSION_COMPLETED_EVENT, CONVERSION_STAGES, DOC_JOB, HDT_JOB, RDF_EXTENSIONS,
};
pub use deployment::{DeploymentSummary, DEPLOYMENT_STAGES, DEPLOYMENT_SUCCEEDED_EVENT, SPIDER_JOB};
pub use run::{PipelineRun, RunStatus, StageDef, StageMode, StageStatus, Workflow};
pub use stage::StageRunner;

use crate::clock::{Sleeper, TokioSleeper};
use crate::cluster::ClusterApi;
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::jobs::{JobController, JobTemplateRegistry};
use crate::notify::NotificationGateway;
use crate::readiness::ReadinessWaiter;
use crate::reconciler::{
    ResourceAllocation, ResourceReconciler, FEDERATION_SET, FUSEKI_SET, LDF_SET,
};
use crate::templates::FileTemplateProvider;
use crate::transfer::{FileTransfer, LakeFsClient};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Metrics for pipeline runs
#[derive(Clone)]
pub struct PipelineMetrics {
    pub started: metrics::Counter,
    pub succeeded: metrics::Counter,
    pub failed: metrics::Counter,
    pub mandatory_failures: metrics::Counter,
    pub best_effort_failures: metrics::Counter,
    pub stage_duration: metrics::Histogram,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            started: metrics::counter!("kace_pipelines_started_total"),
            succeeded: metrics::counter!("kace_pipelines_succeeded_total"),
            failed: metrics::counter!("kace_pipelines_failed_total"),
            mandatory_failures: metrics::counter!("kace_stage_failures_total", "mode" => "mandatory"),
            best_effort_failures: metrics::counter!("kace_stage_failures_total", "mode" => "best_effort"),
            stage_duration: metrics::histogram!("kace_stage_duration_seconds"),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics").finish_non_exhaustive()
    }
}

/// Tuning and locations used by the workflows
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Operator-side mount of the claim jobs work in
    pub local_data_dir: PathBuf,
    /// Operator-side mount of the claim serving pods read from
    pub shared_data_dir: PathBuf,
    pub poll_interval: Duration,
    pub readiness_retries: u32,
    pub readiness_initial_delay: Duration,
    pub conversion_resources: ResourceAllocation,
    pub conversion_env: BTreeMap<String, String>,
    pub spider_host: String,
    pub spider_port: u16,
    pub serving_host: String,
}

impl PipelineSettings {
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            local_data_dir: config.storage.local_data_dir.clone(),
            shared_data_dir: config.storage.shared_data_dir.clone(),
            poll_interval: config.pipeline.poll_interval(),
            readiness_retries: config.pipeline.readiness_retries,
            readiness_initial_delay: config.pipeline.readiness_initial_delay(),
            conversion_resources: ResourceAllocation::limits(
                &config.pipeline.conversion_cpu,
                &config.pipeline.conversion_memory,
            ),
            conversion_env: config.pipeline.conversion_env.clone(),
            spider_host: config.spider.host.clone(),
            spider_port: config.spider.port,
            serving_host: config.serving.host_name.clone(),
        }
    }

    pub fn access_url(&self, kg_name: &str) -> String {
        format!("https://{}/{}/sparql", self.serving_host, kg_name)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&OperatorConfig::default())
    }
}

/// Terminal run state plus the workflow's result
#[derive(Debug)]
pub struct PipelineOutcome<T> {
    pub run: PipelineRun,
    pub result: Result<T>,
}

impl<T> PipelineOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T> {
        self.result
    }
}

/// Runs conversion and deployment workflows
#[derive(Clone)]
pub struct Orchestrator {
    primary: ResourceReconciler,
    secondary: Vec<ResourceReconciler>,
    jobs: JobController,
    readiness: ReadinessWaiter,
    transfer: Arc<dyn FileTransfer>,
    stages: StageRunner,
    settings: PipelineSettings,
    metrics: PipelineMetrics,
}

impl Orchestrator {
    pub fn new(
        primary: ResourceReconciler,
        secondary: Vec<ResourceReconciler>,
        jobs: JobController,
        readiness: ReadinessWaiter,
        transfer: Arc<dyn FileTransfer>,
        gateway: NotificationGateway,
        settings: PipelineSettings,
    ) -> Self {
        let metrics = PipelineMetrics::new();
        Self {
            primary,
            secondary,
            jobs,
            readiness,
            transfer,
            stages: StageRunner::new(gateway, metrics.clone()),
            settings,
            metrics,
        }
    }

    /// Wire every component from configuration
    ///
    /// Templates and job definitions are read from disk once, here.
    pub fn from_config(config: &OperatorConfig, cluster: Arc<dyn ClusterApi>) -> Result<Self> {
        let namespace = config.kubernetes.namespace.as_str();
        let reconciler = |set: &str| -> Result<ResourceReconciler> {
            let templates = FileTemplateProvider::load(config.set_templates_dir(set))?;
            Ok(
                ResourceReconciler::new(set, namespace, cluster.clone(), Arc::new(templates))
                    .with_default("host_name", config.serving.host_name.clone())
                    .with_default("pvc_name", config.kubernetes.shared_pvc_name.clone()),
            )
        };

        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
        let registry = JobTemplateRegistry::load(
            &config.kubernetes.job_templates,
            &config.kubernetes.local_pvc_name,
        )?;
        let jobs = JobController::new(namespace, cluster.clone(), Arc::new(registry), sleeper.clone())
            .with_mount_path(config.kubernetes.job_mount_path.clone());

        let transfer = LakeFsClient::builder()
            .url(config.lakefs.url.clone())
            .access_key(config.lakefs.access_key.clone())
            .secret_key(config.lakefs.secret_key.clone())
            .timeout(Duration::from_secs(config.lakefs.timeout_secs))
            .build()?;

        Ok(Self::new(
            reconciler(FUSEKI_SET)?,
            vec![reconciler(FEDERATION_SET)?, reconciler(LDF_SET)?],
            jobs,
            ReadinessWaiter::new(cluster.clone(), sleeper),
            Arc::new(transfer),
            NotificationGateway::from_config(&config.notifications)?,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn primary(&self) -> &ResourceReconciler {
        &self.primary
    }

    pub fn secondary(&self) -> &[ResourceReconciler] {
        &self.secondary
    }

    /// Record the terminal state of a run
    fn finish<T>(&self, mut run: PipelineRun, result: Result<T>) -> PipelineOutcome<T> {
        match &result {
            Ok(_) => {
                run.succeed();
                self.metrics.succeeded.increment(1);
                info!(run_id = %run.id, workflow = %run.workflow, "Pipeline succeeded");
            }
            Err(e) => {
                run.fail();
                self.metrics.failed.increment(1);
                error!(run_id = %run.id, workflow = %run.workflow, error = %e, "Pipeline failed");
            }
        }
        PipelineOutcome { run, result }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("primary", &self.primary)
            .field("secondary", &self.secondary)
            .field("jobs", &self.jobs)
            .field("settings", &self.settings)
            .finish()
    }
}
