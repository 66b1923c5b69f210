//! # KACE Operator
//!
//! Control plane that turns versioned knowledge-graph data into running
//! Kubernetes workloads.
//!
//! A commit or merge in the data repository triggers a **conversion**: the RDF
//! sources are fetched, converted to HDT by a batch job, documented by a
//! second job and published on a fresh `stable_*` branch with the next patch
//! tag. A tag plus serving parameters triggers a **deployment**: the HDT files
//! are staged on the shared volume, the primary server set for the graph is
//! created or updated and awaited, the shared server sets are refreshed and
//! the release is notarized.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kace_operator::prelude::*;
//! use kube::Client;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OperatorConfig::from_file("kace.yaml")?;
//!     let client = Client::try_default().await?;
//!     let orchestrator = Orchestrator::from_config(&config, Arc::new(KubeClusterApi::new(client)))?;
//!
//!     let event = MergeEvent::new("climate-kg", "main", "abc123de");
//!     let release = orchestrator.run_conversion(&event).await.into_result()?;
//!     println!("published {}", release.tag_name);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`reconciler`] - Create-or-update of the four resources of a server set
//! - [`jobs`] - Batch job submission, completion polling and removal
//! - [`readiness`] - Exponential-backoff readiness polling
//! - [`pipeline`] - Conversion and deployment workflows
//! - [`notify`] - Notification sinks and the fan-out gateway
//! - [`queue`] - In-process task queue with bounded concurrency
//! - [`transfer`] - lakeFS data repository client
//! - [`cluster`] - Kubernetes API seam
//!
//! ## Metrics
//!
//! - `kace_reconciliations_total` - Resource creates and patches by kind
//! - `kace_jobs_submitted_total` / `kace_job_failures_total` - Batch jobs
//! - `kace_readiness_timeouts_total` - Exhausted readiness budgets
//! - `kace_pipelines_{started,succeeded,failed}_total` - Pipeline runs
//! - `kace_stage_failures_total` - Stage failures by mode
//! - `kace_stage_duration_seconds` - Stage latency
//! - `kace_notification_failures_total` - Dropped notifications by sink

pub mod clock;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod jobs;
pub mod notify;
pub mod pipeline;
pub mod queue;
pub mod readiness;
pub mod reconciler;
pub mod release;
pub mod templates;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::clock::{Sleeper, TokioSleeper};
    pub use crate::cluster::{ClusterApi, KubeClusterApi, ManagedResource, ResourceKind, ResourceRef};
    pub use crate::config::OperatorConfig;
    pub use crate::error::{OperatorError, Result};
    pub use crate::events::{DeploymentRequest, MergeEvent, TagEvent};
    pub use crate::jobs::{JobController, JobSpec, JobTemplateRegistry, VolumeContext};
    pub use crate::notify::{
        EmailNotifier, LogNotifier, NotificationContext, NotificationGateway, NotificationSink,
        SlackNotifier,
    };
    pub use crate::pipeline::{
        DeploymentSummary, Orchestrator, PipelineOutcome, PipelineRun, PipelineSettings,
        RunStatus, StageMode, Workflow,
    };
    pub use crate::queue::{LocalTaskQueue, PipelineTask, TaskQueue};
    pub use crate::readiness::{ReadinessCheck, ReadinessWaiter};
    pub use crate::reconciler::{ResourceAllocation, ResourceReconciler, ResourceSpec};
    pub use crate::templates::{FileTemplateProvider, TemplateProvider};
    pub use crate::transfer::{FileTransfer, LakeFsClient, PublishedRelease};
}
