//! Stage failure interceptor
//!
//! Every stage of every workflow runs through [`StageRunner::run_stage`]. On
//! error it sends a `Pipeline stage failed` notification carrying the stage
//! name, the run context and the error text. A mandatory stage then fails the
//! run and surfaces [`OperatorError::StageFailed`]; a best-effort stage is
//! recorded as failed and the run continues.

use super::run::{PipelineRun, StageMode};
use super::PipelineMetrics;
use crate::error::{OperatorError, Result};
use crate::notify::{NotificationGateway, STAGE_FAILED_EVENT};
use std::future::Future;
use std::time::Instant;
use tracing::{debug, error, warn};

#[derive(Clone, Debug)]
pub struct StageRunner {
    gateway: NotificationGateway,
    metrics: PipelineMetrics,
}

impl StageRunner {
    pub fn new(gateway: NotificationGateway, metrics: PipelineMetrics) -> Self {
        Self { gateway, metrics }
    }

    pub fn gateway(&self) -> &NotificationGateway {
        &self.gateway
    }

    /// Run one stage; `Ok(None)` means a best-effort stage failed
    pub async fn run_stage<T, Fut>(
        &self,
        run: &mut PipelineRun,
        name: &'static str,
        mode: StageMode,
        stage: Fut,
    ) -> Result<Option<T>>
    where
        Fut: Future<Output = Result<T>>,
    {
        run.begin_stage(name);
        debug!(run_id = %run.id, workflow = %run.workflow, stage = name, "Stage started");
        let started = Instant::now();
        let outcome = stage.await;
        let elapsed = started.elapsed();
        self.metrics.stage_duration.record(elapsed.as_secs_f64());

        match outcome {
            Ok(value) => {
                run.complete_stage(name, elapsed);
                debug!(run_id = %run.id, stage = name, ?elapsed, "Stage completed");
                Ok(Some(value))
            }
            Err(e) => {
                let message = e.to_string();
                let mut context = run.context.clone();
                context.insert("stage".to_string(), name.into());
                context.insert("error_message".to_string(), message.clone().into());
                context.insert(
                    "best_effort".to_string(),
                    (mode == StageMode::BestEffort).into(),
                );
                self.gateway.notify(STAGE_FAILED_EVENT, &context).await;
                run.fail_stage(name, message.clone(), elapsed);

                match mode {
                    StageMode::BestEffort => {
                        self.metrics.best_effort_failures.increment(1);
                        warn!(run_id = %run.id, stage = name, error = %message, "Best-effort stage failed, continuing");
                        Ok(None)
                    }
                    StageMode::Mandatory => {
                        self.metrics.mandatory_failures.increment(1);
                        error!(run_id = %run.id, stage = name, error = %message, "Mandatory stage failed, aborting pipeline");
                        run.fail();
                        Err(OperatorError::StageFailed {
                            stage: name.to_string(),
                            message,
                        })
                    }
                }
            }
        }
    }

    /// Run a mandatory stage
    pub async fn mandatory<T, Fut>(
        &self,
        run: &mut PipelineRun,
        name: &'static str,
        stage: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.run_stage(run, name, StageMode::Mandatory, stage)
            .await?
            .ok_or_else(|| OperatorError::Internal(format!("stage {} returned no output", name)))
    }

    /// Run a best-effort stage; failures are reported and swallowed
    pub async fn best_effort<T, Fut>(
        &self,
        run: &mut PipelineRun,
        name: &'static str,
        stage: Fut,
    ) -> Option<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.run_stage(run, name, StageMode::BestEffort, stage)
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::run::{RunStatus, StageDef, StageStatus, Workflow};
    use crate::testing::RecordingSink;
    use std::sync::Arc;

    const STAGES: &[StageDef] = &[
        StageDef::mandatory("convert"),
        StageDef::best_effort("notarize"),
        StageDef::mandatory("notify"),
    ];

    fn runner() -> (StageRunner, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let gateway = NotificationGateway::new().with_sink(sink.clone());
        (StageRunner::new(gateway, PipelineMetrics::new()), sink)
    }

    fn new_run() -> PipelineRun {
        let mut context = crate::notify::NotificationContext::new();
        context.insert("repository".to_string(), "climate-kg".into());
        PipelineRun::new(Workflow::Conversion, STAGES, context)
    }

    #[tokio::test]
    async fn test_success_passes_value_through() {
        let (runner, sink) = runner();
        let mut run = new_run();
        let value = runner
            .mandatory(&mut run, "convert", async { Ok::<_, OperatorError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(run.stage("convert").unwrap().status, StageStatus::Succeeded);
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_mandatory_failure_notifies_and_reraises() {
        let (runner, sink) = runner();
        let mut run = new_run();
        let err = runner
            .mandatory(&mut run, "convert", async {
                Err::<(), _>(OperatorError::Internal("disk full".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, OperatorError::StageFailed { ref stage, .. } if stage == "convert"));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.stage("notify").unwrap().status, StageStatus::Skipped);

        let notifications = sink.notifications();
        assert_eq!(notifications.len(), 1);
        let (event, context) = &notifications[0];
        assert_eq!(event, STAGE_FAILED_EVENT);
        assert_eq!(context["stage"], "convert");
        assert_eq!(context["repository"], "climate-kg");
        assert_eq!(context["workflow"], "conversion");
        assert!(context["error_message"].as_str().unwrap().contains("disk full"));
    }

    #[tokio::test]
    async fn test_best_effort_failure_is_swallowed() {
        let (runner, sink) = runner();
        let mut run = new_run();
        let value: Option<()> = runner
            .best_effort(&mut run, "notarize", async {
                Err(OperatorError::Internal("spider down".to_string()))
            })
            .await;

        assert!(value.is_none());
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.stage("notarize").unwrap().status, StageStatus::Failed);
        assert_eq!(sink.notifications()[0].1["best_effort"], true);
    }
}
