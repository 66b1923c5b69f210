//! Pipeline run state
//!
//! A [`PipelineRun`] is created per inbound event and advances stage by stage.
//! Once it reaches `Succeeded` or `Failed` it never changes again.

use crate::notify::NotificationContext;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Named workflows the orchestrator runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    Conversion,
    Deployment,
}

impl Workflow {
    pub fn as_str(&self) -> &'static str {
        match self {
            Workflow::Conversion => "conversion",
            Workflow::Deployment => "deployment",
        }
    }
}

impl fmt::Display for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a stage failure aborts the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMode {
    Mandatory,
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Not reached because an earlier mandatory stage failed
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A stage definition: name plus mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDef {
    pub name: &'static str,
    pub mode: StageMode,
}

impl StageDef {
    pub const fn mandatory(name: &'static str) -> Self {
        Self {
            name,
            mode: StageMode::Mandatory,
        }
    }

    pub const fn best_effort(name: &'static str) -> Self {
        Self {
            name,
            mode: StageMode::BestEffort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord {
    pub name: &'static str,
    pub mode: StageMode,
    pub status: StageStatus,
    pub error: Option<String>,
    #[serde(skip)]
    pub duration: Option<Duration>,
}

/// One execution of a workflow
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub workflow: Workflow,
    pub stages: Vec<StageRecord>,
    pub current_stage_index: usize,
    pub status: RunStatus,
    /// Event context attached to every notification of this run
    pub context: NotificationContext,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(workflow: Workflow, stages: &[StageDef], context: NotificationContext) -> Self {
        let mut context = context;
        context.insert(
            "workflow".to_string(),
            serde_json::Value::String(workflow.to_string()),
        );
        Self {
            id: Uuid::new_v4(),
            workflow,
            stages: stages
                .iter()
                .map(|def| StageRecord {
                    name: def.name,
                    mode: def.mode,
                    status: StageStatus::Pending,
                    error: None,
                    duration: None,
                })
                .collect(),
            current_stage_index: 0,
            status: RunStatus::Running,
            context,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Mode of a stage; unknown stages are mandatory
    pub fn mode_of(&self, name: &str) -> StageMode {
        self.stage(name).map_or(StageMode::Mandatory, |s| s.mode)
    }

    pub fn current_stage(&self) -> Option<&StageRecord> {
        self.stages.get(self.current_stage_index)
    }

    /// Mark a stage running. Ignored once the run is terminal.
    pub fn begin_stage(&mut self, name: &str) {
        if self.status.is_terminal() {
            return;
        }
        if let Some(index) = self.index_of(name) {
            self.current_stage_index = index;
            self.stages[index].status = StageStatus::Running;
        }
    }

    pub fn complete_stage(&mut self, name: &str, duration: Duration) {
        self.finish_stage(name, StageStatus::Succeeded, None, duration);
    }

    pub fn fail_stage(&mut self, name: &str, error: String, duration: Duration) {
        self.finish_stage(name, StageStatus::Failed, Some(error), duration);
    }

    fn finish_stage(
        &mut self,
        name: &str,
        status: StageStatus,
        error: Option<String>,
        duration: Duration,
    ) {
        if self.status.is_terminal() {
            return;
        }
        if let Some(index) = self.index_of(name) {
            let stage = &mut self.stages[index];
            stage.status = status;
            stage.error = error;
            stage.duration = Some(duration);
        }
    }

    /// Terminate successfully
    pub fn succeed(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = RunStatus::Succeeded;
        self.finished_at = Some(Utc::now());
    }

    /// Terminate with failure; stages never reached are marked skipped
    pub fn fail(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        for stage in &mut self.stages {
            if stage.status == StageStatus::Pending {
                stage.status = StageStatus::Skipped;
            }
        }
        self.status = RunStatus::Failed;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAGES: &[StageDef] = &[
        StageDef::mandatory("reconcile"),
        StageDef::best_effort("notarize"),
        StageDef::mandatory("notify"),
    ];

    #[test]
    fn test_new_run() {
        let run = PipelineRun::new(Workflow::Deployment, STAGES, NotificationContext::new());
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.stages.len(), 3);
        assert_eq!(run.context["workflow"], "deployment");
        assert_eq!(run.mode_of("notarize"), StageMode::BestEffort);
        assert_eq!(run.mode_of("unknown"), StageMode::Mandatory);
    }

    #[test]
    fn test_stage_progression() {
        let mut run = PipelineRun::new(Workflow::Deployment, STAGES, NotificationContext::new());
        run.begin_stage("reconcile");
        run.complete_stage("reconcile", Duration::from_millis(5));
        run.begin_stage("notarize");
        assert_eq!(run.current_stage_index, 1);
        assert_eq!(run.current_stage().unwrap().status, StageStatus::Running);
    }

    #[test]
    fn test_failure_skips_remaining_and_is_final() {
        let mut run = PipelineRun::new(Workflow::Conversion, STAGES, NotificationContext::new());
        run.begin_stage("reconcile");
        run.fail_stage("reconcile", "boom".to_string(), Duration::ZERO);
        run.fail();

        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage("notarize").unwrap().status, StageStatus::Skipped);
        assert!(run.finished_at.is_some());

        // terminal states never revert
        run.succeed();
        run.begin_stage("notify");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage("notify").unwrap().status, StageStatus::Skipped);
    }
}
