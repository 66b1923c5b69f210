//! Conversion workflow: RDF sources on a branch -> HDT release
//!
//! Sources are pulled from the data repository into the shared volume, a
//! conversion job turns them into an HDT file, a documentation job writes a
//! report next to it and both are published on a fresh `stable_*` branch with
//! the next patch tag.

use super::run::{PipelineRun, StageDef, Workflow};
use super::{Orchestrator, PipelineOutcome};
use crate::error::{OperatorError, Result};
use crate::events::MergeEvent;
use crate::jobs::{job_name, JobSpec, VolumeContext};
use crate::notify::NotificationContext;
use crate::transfer::{relative_object_path, write_file, LocalArtifact, PublishedRelease};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

pub const HDT_JOB: &str = "hdt-job";
pub const DOC_JOB: &str = "doc-job";

pub const CONVERSION_COMPLETED_EVENT: &str = "Conversion completed";

/// Source files picked up for conversion
pub const RDF_EXTENSIONS: &[&str] = &[
    "ttl", "nt", "nq", "n3", "rdf", "owl", "xml", "jsonld", "trig",
];

/// Generated graph file, relative to the job's working directory
const HDT_FILE: &str = "hdt/graph.hdt";
const HDT_INDEX_FILE: &str = "hdt/graph.hdt.index.v1-1";
const REPORT_DIR: &str = "report";

pub const CONVERSION_STAGES: &[StageDef] = &[
    StageDef::mandatory("acquire-sources"),
    StageDef::mandatory("convert"),
    StageDef::mandatory("document"),
    StageDef::mandatory("publish"),
    StageDef::mandatory("notify"),
];

fn is_rdf_source(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| RDF_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

impl Orchestrator {
    /// Run the conversion workflow for a merge or commit event
    #[instrument(skip(self, event), fields(repo = %event.repository_id, branch = %event.branch_id, commit = %event.commit_id))]
    pub async fn run_conversion(&self, event: &MergeEvent) -> PipelineOutcome<PublishedRelease> {
        let mut context = NotificationContext::new();
        context.insert("repository".to_string(), event.repository_id.clone().into());
        context.insert("branch".to_string(), event.branch_id.clone().into());
        context.insert("commit".to_string(), event.commit_id.clone().into());

        let mut run = PipelineRun::new(Workflow::Conversion, CONVERSION_STAGES, context);
        self.metrics.started.increment(1);
        info!(run_id = %run.id, "Starting conversion");

        if let Err(e) = event.check() {
            return self.finish(run, Err(e));
        }

        let result = self.conversion_stages(&mut run, event).await;
        self.finish(run, result)
    }

    async fn conversion_stages(
        &self,
        run: &mut PipelineRun,
        event: &MergeEvent,
    ) -> Result<PublishedRelease> {
        let volume = VolumeContext::new(&event.repository_id, &event.branch_id);

        let sources = self
            .stages
            .mandatory(run, "acquire-sources", self.acquire_sources(event))
            .await?;

        let hdt_output = format!("{}/{}", self.jobs.mount_path(), HDT_FILE);
        self.stages
            .mandatory(run, "convert", self.convert_sources(event, &volume, &sources))
            .await?;

        self.stages
            .mandatory(run, "document", self.document(event, &volume, &hdt_output))
            .await?;

        let release = self
            .stages
            .mandatory(run, "publish", self.publish(event))
            .await?;

        let mut context = run.context.clone();
        context.insert("tag".to_string(), release.tag_name.clone().into());
        context.insert("release_branch".to_string(), release.branch_name.clone().into());
        let gateway = self.stages.gateway();
        self.stages
            .mandatory(run, "notify", async {
                gateway.notify(CONVERSION_COMPLETED_EVENT, &context).await;
                Ok(())
            })
            .await?;

        Ok(release)
    }

    /// Working directory of a repo/branch on the operator's mount
    fn work_dir(&self, event: &MergeEvent) -> PathBuf {
        self.settings
            .local_data_dir
            .join(&event.repository_id)
            .join(&event.branch_id)
    }

    /// Fetch the branch's RDF files into a clean working directory
    async fn acquire_sources(&self, event: &MergeEvent) -> Result<Vec<String>> {
        let repo_dir = self.settings.local_data_dir.join(&event.repository_id);
        match tokio::fs::remove_dir_all(&repo_dir).await {
            Ok(()) => debug!(dir = %repo_dir.display(), "Cleaned previous working data"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let objects = self
            .transfer
            .list_objects(&event.repository_id, &event.branch_id, "")
            .await?;
        let sources: Vec<String> = objects
            .into_iter()
            .map(|o| o.path)
            .filter(|p| is_rdf_source(p))
            .collect();
        if sources.is_empty() {
            return Err(OperatorError::Transfer {
                status: 404,
                message: format!(
                    "no RDF sources on {}/{}",
                    event.repository_id, event.branch_id
                ),
            });
        }

        // every key is checked before the first write
        let targets = sources
            .iter()
            .map(|key| relative_object_path(key))
            .collect::<Result<Vec<_>>>()?;

        let work_dir = self.work_dir(event);
        for (key, relative) in sources.iter().zip(&targets) {
            let bytes = self
                .transfer
                .download(&event.repository_id, &event.branch_id, key)
                .await?;
            write_file(&work_dir.join(relative), &bytes).await?;
        }
        info!(files = sources.len(), "Acquired RDF sources");
        Ok(sources)
    }

    async fn convert_sources(
        &self,
        event: &MergeEvent,
        volume: &VolumeContext,
        sources: &[String],
    ) -> Result<()> {
        let name = job_name(
            "hdt",
            &[event.repository_id.as_str(), event.branch_id.as_str()],
            &event.commit_id,
        );
        let spec = JobSpec::new(HDT_JOB, name)
            .with_args(sources.iter().cloned())
            .with_resources(self.settings.conversion_resources.clone())
            .with_env(self.settings.conversion_env.clone());
        self.jobs
            .run_to_completion(&spec, volume, self.settings.poll_interval)
            .await?;
        Ok(())
    }

    async fn document(&self, event: &MergeEvent, volume: &VolumeContext, hdt_output: &str) -> Result<()> {
        let name = job_name(
            "doc",
            &[event.repository_id.as_str(), event.branch_id.as_str()],
            &event.commit_id,
        );
        let report_dir = format!("{}/{}", self.jobs.mount_path(), REPORT_DIR);
        let spec = JobSpec::new(DOC_JOB, name).with_args([
            "--hdt",
            hdt_output,
            "--output",
            report_dir.as_str(),
        ]);
        self.jobs
            .run_to_completion(&spec, volume, self.settings.poll_interval)
            .await?;
        Ok(())
    }

    /// Upload the graph and its report as the next release
    async fn publish(&self, event: &MergeEvent) -> Result<PublishedRelease> {
        let work_dir = self.work_dir(event);
        let mut artifacts = vec![
            LocalArtifact::new(work_dir.join(HDT_FILE), "hdt"),
            LocalArtifact::new(work_dir.join(HDT_INDEX_FILE), "hdt"),
        ];
        artifacts.extend(
            report_files(&work_dir.join(REPORT_DIR))
                .await?
                .into_iter()
                .map(|path| LocalArtifact::new(path, REPORT_DIR)),
        );

        self.transfer
            .upload(&event.repository_id, &event.branch_id, &artifacts)
            .await
    }
}

/// Files directly under the report directory; a missing directory is empty
async fn report_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
