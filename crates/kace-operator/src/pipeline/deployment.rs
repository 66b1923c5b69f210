//! Deployment workflow: tagged HDT release -> serving endpoint
//!
//! Stage order is fixed: artifacts land on the shared volume, the primary
//! server set for the graph is reconciled and awaited, the shared secondary
//! sets are refreshed, the release is notarized and finally announced.
//! Notarization is the only best-effort stage.

use super::run::{PipelineRun, StageDef, Workflow};
use super::{Orchestrator, PipelineOutcome};
use crate::cluster::ResourceRef;
use crate::error::{OperatorError, Result};
use crate::events::DeploymentRequest;
use crate::jobs::{job_name, JobSpec, VolumeContext};
use crate::notify::NotificationContext;
use crate::readiness::ReadinessCheck;
use crate::reconciler::{ResourceAllocation, SHARED_TARGET};
use crate::transfer::write_file;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, instrument};

pub const SPIDER_JOB: &str = "spider-job";

pub const DEPLOYMENT_SUCCEEDED_EVENT: &str = "Deployment succeeded";

/// Artifact suffixes served by the primary set
const HDT_SUFFIXES: &[&str] = &[".hdt", ".hdt.index.v1-1"];

/// Directory under the shared mount that serving pods read graphs from
const DEPLOY_DIR: &str = "deploy";

pub const DEPLOYMENT_STAGES: &[StageDef] = &[
    StageDef::mandatory("stage-artifacts"),
    StageDef::mandatory("reconcile-primary"),
    StageDef::mandatory("await-readiness"),
    StageDef::mandatory("reconcile-secondary"),
    StageDef::best_effort("notarize"),
    StageDef::mandatory("notify"),
];

/// What a successful deployment exposes
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentSummary {
    pub kg_name: String,
    pub version: String,
    pub access_url: String,
    pub resources: Vec<ResourceRef>,
    /// False when the best-effort notarization failed
    pub notarized: bool,
}

/// `.hdt` or `.hdt.index.v1-1`, whichever the object path ends with
fn hdt_suffix(path: &str) -> Option<&'static str> {
    HDT_SUFFIXES.iter().copied().find(|suffix| path.ends_with(suffix))
}

fn primary_annotations(request: &DeploymentRequest) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("kg-name".to_string(), request.kg_name.clone()),
        ("version".to_string(), request.event.tag_id.clone()),
        (
            "lakefs-repository".to_string(),
            request.event.repository_id.clone(),
        ),
        ("commit".to_string(), request.event.commit_id.clone()),
    ])
}

impl Orchestrator {
    /// Run the deployment workflow for a tag
    #[instrument(skip(self, request), fields(kg = %request.kg_name, repo = %request.event.repository_id, tag = %request.event.tag_id))]
    pub async fn run_deployment(
        &self,
        request: &DeploymentRequest,
    ) -> PipelineOutcome<DeploymentSummary> {
        let mut context = NotificationContext::new();
        context.insert(
            "repository".to_string(),
            request.event.repository_id.clone().into(),
        );
        context.insert("tag".to_string(), request.event.tag_id.clone().into());
        context.insert("commit".to_string(), request.event.commit_id.clone().into());
        context.insert("kg_name".to_string(), request.kg_name.clone().into());

        let mut run = PipelineRun::new(Workflow::Deployment, DEPLOYMENT_STAGES, context);
        self.metrics.started.increment(1);
        info!(run_id = %run.id, "Starting deployment");

        if let Err(e) = request.check() {
            return self.finish(run, Err(e));
        }

        let result = self.deployment_stages(&mut run, request).await;
        self.finish(run, result)
    }

    async fn deployment_stages(
        &self,
        run: &mut PipelineRun,
        request: &DeploymentRequest,
    ) -> Result<DeploymentSummary> {
        let kg_name = request.kg_name.as_str();
        let annotations = primary_annotations(request);

        self.stages
            .mandatory(run, "stage-artifacts", self.stage_artifacts(request))
            .await?;

        let resources = self
            .stages
            .mandatory(
                run,
                "reconcile-primary",
                self.reconcile_primary(request, &annotations),
            )
            .await?;

        self.stages
            .mandatory(
                run,
                "await-readiness",
                self.await_readiness(kg_name, &resources, &annotations),
            )
            .await?;

        self.stages
            .mandatory(run, "reconcile-secondary", self.reconcile_secondary())
            .await?;

        let notarized = self
            .stages
            .best_effort(run, "notarize", self.notarize(request))
            .await
            .is_some();

        let summary = DeploymentSummary {
            kg_name: request.kg_name.clone(),
            version: request.event.tag_id.clone(),
            access_url: self.settings.access_url(kg_name),
            resources,
            notarized,
        };

        let mut context = run.context.clone();
        context.insert("version".to_string(), summary.version.clone().into());
        context.insert("access_url".to_string(), summary.access_url.clone().into());
        let gateway = self.stages.gateway();
        self.stages
            .mandatory(run, "notify", async {
                gateway.notify(DEPLOYMENT_SUCCEEDED_EVENT, &context).await;
                Ok(())
            })
            .await?;

        Ok(summary)
    }

    /// Download the release's HDT files to the shared volume
    ///
    /// Files are written under a temporary name first and renamed once every
    /// download finished, so serving pods never see a partial graph.
    async fn stage_artifacts(&self, request: &DeploymentRequest) -> Result<Vec<PathBuf>> {
        let event = &request.event;
        let deploy_dir = self.settings.shared_data_dir.join(DEPLOY_DIR);

        let objects = self
            .transfer
            .list_objects(&event.repository_id, &event.tag_id, &request.hdt_prefix())
            .await?;

        let mut staged = Vec::new();
        for object in objects {
            let Some(suffix) = hdt_suffix(&object.path) else {
                continue;
            };
            let bytes = self
                .transfer
                .download(&event.repository_id, &event.tag_id, &object.path)
                .await?;
            let temporary = deploy_dir.join(format!("{}-{}{}", event.tag_id, request.kg_name, suffix));
            let target = deploy_dir.join(format!("{}{}", request.kg_name, suffix));
            write_file(&temporary, &bytes).await?;
            staged.push((temporary, target));
        }

        if staged.is_empty() {
            return Err(OperatorError::Transfer {
                status: 404,
                message: format!(
                    "no HDT artifacts under {}@{}/{}",
                    event.repository_id,
                    event.tag_id,
                    request.hdt_prefix()
                ),
            });
        }

        let mut paths = Vec::with_capacity(staged.len());
        for (temporary, target) in staged {
            tokio::fs::rename(&temporary, &target).await?;
            paths.push(target);
        }
        info!(files = paths.len(), dir = %deploy_dir.display(), "Staged HDT artifacts");
        Ok(paths)
    }

    async fn reconcile_primary(
        &self,
        request: &DeploymentRequest,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Vec<ResourceRef>> {
        let parameters = BTreeMap::from([("kg_name".to_string(), request.kg_name.clone())]);
        let allocation = ResourceAllocation::cpu_memory(&request.cpu, &request.memory);
        self.primary
            .create_all(&request.kg_name, &parameters, annotations, Some(&allocation))
            .await
    }

    async fn await_readiness(
        &self,
        kg_name: &str,
        resources: &[ResourceRef],
        annotations: &BTreeMap<String, String>,
    ) -> Result<()> {
        let check = ReadinessCheck::new(resources.to_vec())
            .with_annotations(annotations.clone())
            .with_max_retries(self.settings.readiness_retries)
            .with_initial_delay(self.settings.readiness_initial_delay);
        let report = self.readiness.wait(&check).await?;
        if report.ready {
            Ok(())
        } else {
            Err(report.timeout_error(kg_name, &check))
        }
    }

    /// Refresh the shared sets so they pick up the new graph
    async fn reconcile_secondary(&self) -> Result<()> {
        let none = BTreeMap::new();
        for reconciler in &self.secondary {
            reconciler
                .create_all(SHARED_TARGET, &none, &none, None)
                .await?;
        }
        Ok(())
    }

    /// Record the release with the notarization service
    async fn notarize(&self, request: &DeploymentRequest) -> Result<()> {
        if self.settings.spider_host.is_empty() || self.settings.spider_port == 0 {
            return Err(OperatorError::InvalidConfig(
                "notarization endpoint (spider.host, spider.port) is not configured".to_string(),
            ));
        }

        let event = &request.event;
        let commit = self
            .transfer
            .resolve_commit(&event.repository_id, &event.commit_id)
            .await?;

        let name = job_name("spider-cl", &[request.kg_name.as_str()], &event.commit_id);
        let port = self.settings.spider_port.to_string();
        let spec = JobSpec::new(SPIDER_JOB, name).with_args([
            "/app/spider-client.py",
            "--commit-id",
            event.commit_id.as_str(),
            "--graph-name",
            request.kg_name.as_str(),
            "--committer-name",
            commit.committer.as_str(),
            "--ip",
            self.settings.spider_host.as_str(),
            "--port",
            port.as_str(),
        ]);
        let volume = VolumeContext::new(&event.repository_id, &event.commit_id);
        self.jobs
            .run_to_completion(&spec, &volume, self.settings.poll_interval)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ResourceKind;
    use crate::events::TagEvent;
    use crate::notify::STAGE_FAILED_EVENT;
    use crate::pipeline::{RunStatus, StageStatus};
    use crate::testing::{FakeTransfer, Harness};
    use std::time::Duration;

    fn request() -> DeploymentRequest {
        DeploymentRequest::new(
            TagEvent::new("climate-kg", "v0.0.2", "abc123def456"),
            "climatekg",
            "2",
            "4Gi",
        )
    }

    fn release_transfer() -> FakeTransfer {
        FakeTransfer::new()
            .with_object("climate-kg", "v0.0.2", "hdt/graph.hdt", b"HDT")
            .with_object("climate-kg", "v0.0.2", "hdt/graph.hdt.index.v1-1", b"IDX")
            .with_object("climate-kg", "v0.0.2", "report/index.html", b"<html/>")
            .with_committer("ada")
    }

    #[test]
    fn test_hdt_suffix() {
        assert_eq!(hdt_suffix("hdt/graph.hdt"), Some(".hdt"));
        assert_eq!(hdt_suffix("hdt/graph.hdt.index.v1-1"), Some(".hdt.index.v1-1"));
        assert_eq!(hdt_suffix("report/index.html"), None);
    }

    #[tokio::test]
    async fn test_deployment_end_to_end() {
        let harness = Harness::new(release_transfer()).with_spider("spider.local", 8080);
        harness.cluster.succeed_jobs_immediately();
        harness.cluster.make_deployments_available();

        let outcome = harness.orchestrator.run_deployment(&request()).await;
        let summary = outcome.result.unwrap();
        assert_eq!(outcome.run.status, RunStatus::Succeeded);
        assert!(summary.notarized);
        assert_eq!(summary.access_url, "https://localhost/climatekg/sparql");

        let deploy_dir = harness.shared_dir().join("deploy");
        assert_eq!(std::fs::read(deploy_dir.join("climatekg.hdt")).unwrap(), b"HDT");
        assert!(deploy_dir.join("climatekg.hdt.index.v1-1").exists());
        assert!(!deploy_dir.join("v0.0.2-climatekg.hdt").exists());

        let deployment = harness
            .cluster
            .resource(&ResourceRef::new(
                ResourceKind::Deployment,
                "fuseki-climatekg",
                "kace",
            ))
            .unwrap();
        let annotations = deployment.annotations();
        assert_eq!(annotations["kg-name"], "climatekg");
        assert_eq!(annotations["version"], "v0.0.2");
        assert_eq!(annotations["lakefs-repository"], "climate-kg");
        assert_eq!(annotations["commit"], "abc123def456");

        assert!(harness
            .cluster
            .resource(&ResourceRef::new(ResourceKind::Service, "federation-all", "kace"))
            .is_some());
        assert!(harness
            .cluster
            .resource(&ResourceRef::new(ResourceKind::Ingress, "ldf-all", "kace"))
            .is_some());

        let spider = harness.cluster.job("spider-cl-climatekg-abc123def4").unwrap();
        let container = &spider.spec.unwrap().template.spec.unwrap().containers[0];
        let args = container.args.clone().unwrap();
        assert_eq!(args[0], "/app/spider-client.py");
        assert!(args.windows(2).any(|w| w == ["--committer-name", "ada"]));
        assert!(args.windows(2).any(|w| w == ["--port", "8080"]));
        assert_eq!(
            container.volume_mounts.as_ref().unwrap()[0].sub_path.as_deref(),
            Some("climate-kg/abc123def456")
        );

        let notifications = harness.sink.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0, DEPLOYMENT_SUCCEEDED_EVENT);
        assert_eq!(notifications[0].1["version"], "v0.0.2");
    }

    #[tokio::test]
    async fn test_notarization_failure_is_isolated() {
        let harness = Harness::new(release_transfer().failing_commit_lookup())
            .with_spider("spider.local", 8080);
        harness.cluster.make_deployments_available();

        let outcome = harness.orchestrator.run_deployment(&request()).await;
        let summary = outcome.result.unwrap();
        assert!(!summary.notarized);
        assert_eq!(outcome.run.status, RunStatus::Succeeded);
        assert_eq!(outcome.run.stage("notarize").unwrap().status, StageStatus::Failed);
        assert_eq!(outcome.run.stage("notify").unwrap().status, StageStatus::Succeeded);

        let events = harness.sink.events();
        assert_eq!(
            events,
            vec![
                STAGE_FAILED_EVENT.to_string(),
                DEPLOYMENT_SUCCEEDED_EVENT.to_string()
            ]
        );
        let failure = &harness.sink.notifications()[0].1;
        assert_eq!(failure["stage"], "notarize");
        assert_eq!(failure["best_effort"], true);
    }

    #[tokio::test]
    async fn test_unconfigured_notarization_is_best_effort() {
        let harness = Harness::new(release_transfer());
        harness.cluster.make_deployments_available();

        let outcome = harness.orchestrator.run_deployment(&request()).await;
        assert!(outcome.is_success());
        assert!(harness.cluster.job_names().is_empty());
    }

    #[tokio::test]
    async fn test_readiness_timeout_fails_pipeline() {
        let harness = Harness::new(release_transfer()).with_readiness_retries(3);

        let outcome = harness.orchestrator.run_deployment(&request()).await;
        assert_eq!(outcome.run.status, RunStatus::Failed);
        assert_eq!(
            outcome.run.stage("await-readiness").unwrap().status,
            StageStatus::Failed
        );
        assert_eq!(
            outcome.run.stage("reconcile-secondary").unwrap().status,
            StageStatus::Skipped
        );
        assert_eq!(
            harness.sleeper.delays(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );

        let notifications = harness.sink.notifications();
        assert_eq!(notifications.len(), 1);
        let (event, context) = &notifications[0];
        assert_eq!(event, STAGE_FAILED_EVENT);
        assert_eq!(context["stage"], "await-readiness");
        assert!(context["error_message"]
            .as_str()
            .unwrap()
            .contains("climatekg"));

        // shared sets are left alone when the primary never became ready
        assert!(harness
            .cluster
            .resource(&ResourceRef::new(ResourceKind::Service, "federation-all", "kace"))
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_artifacts_fail_before_reconcile() {
        let harness = Harness::new(FakeTransfer::new());

        let outcome = harness.orchestrator.run_deployment(&request()).await;
        assert!(matches!(
            outcome.result,
            Err(OperatorError::StageFailed { ref stage, .. }) if stage == "stage-artifacts"
        ));
        assert_eq!(harness.cluster.resource_count(), 0);
    }
    #[tokio::test]
    async fn test_unsafe_kg_name_is_rejected_before_staging() {
        let harness = Harness::new(release_transfer());
        harness.cluster.make_deployments_available();

        let mut request = request();
        request.kg_name = "../../pwned".to_string();
        let outcome = harness.orchestrator.run_deployment(&request).await;
        assert!(matches!(outcome.result, Err(OperatorError::InvalidRequest(_))));
        assert_eq!(outcome.run.status, RunStatus::Failed);
        for stage in DEPLOYMENT_STAGES {
            assert_eq!(
                outcome.run.stage(stage.name).unwrap().status,
                StageStatus::Skipped
            );
        }
        assert_eq!(harness.cluster.resource_count(), 0);
        assert!(!harness.shared_dir().join("deploy").exists());
        assert!(!harness.shared_dir().join("pwned.hdt").exists());
        assert!(harness.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_quantity_is_rejected() {
        let harness = Harness::new(release_transfer());

        let mut request = request();
        request.cpu = "two cores".to_string();
        let outcome = harness.orchestrator.run_deployment(&request).await;
        let err = outcome.result.unwrap_err();
        assert!(matches!(err, OperatorError::InvalidRequest(_)));
        assert!(err.to_string().contains("cpu"));
        assert_eq!(
            outcome.run.stage("stage-artifacts").unwrap().status,
            StageStatus::Skipped
        );
        assert_eq!(harness.cluster.resource_count(), 0);
    }
}
