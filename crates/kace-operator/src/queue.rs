//! Pipeline task queue
//!
//! Events are turned into [`PipelineTask`]s and handed to a [`TaskQueue`].
//! [`LocalTaskQueue`] runs them in-process: a dispatcher drains a bounded
//! channel and spawns every task under a semaphore sized to the worker
//! count. Each task runs to completion independently of the others.

use crate::error::{OperatorError, Result};
use crate::events::{DeploymentRequest, MergeEvent};
use crate::pipeline::{Orchestrator, PipelineRun, Workflow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pending tasks buffered per worker before `enqueue` waits
const QUEUE_DEPTH_PER_WORKER: usize = 16;

/// Unit of work for the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum PipelineTask {
    Convert(MergeEvent),
    Deploy(DeploymentRequest),
}

impl PipelineTask {
    pub fn workflow(&self) -> Workflow {
        match self {
            PipelineTask::Convert(_) => Workflow::Conversion,
            PipelineTask::Deploy(_) => Workflow::Deployment,
        }
    }

    pub fn repository(&self) -> &str {
        match self {
            PipelineTask::Convert(event) => &event.repository_id,
            PipelineTask::Deploy(request) => &request.event.repository_id,
        }
    }
}

/// Run one task to completion and return its terminal run
pub async fn execute(orchestrator: &Orchestrator, task: &PipelineTask) -> PipelineRun {
    match task {
        PipelineTask::Convert(event) => orchestrator.run_conversion(event).await.run,
        PipelineTask::Deploy(request) => orchestrator.run_deployment(request).await.run,
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: PipelineTask) -> Result<()>;
}

/// In-process queue backed by a bounded channel
pub struct LocalTaskQueue {
    sender: Mutex<Option<mpsc::Sender<PipelineTask>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    workers: usize,
}

impl LocalTaskQueue {
    /// Start the dispatcher; at most `workers` pipelines run at once
    pub fn start(orchestrator: Arc<Orchestrator>, workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel(workers * QUEUE_DEPTH_PER_WORKER);
        let dispatcher = tokio::spawn(dispatch(orchestrator, receiver, workers));
        info!(workers, "Task queue started");
        Self {
            sender: Mutex::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Stop accepting tasks and wait for queued and running ones to finish
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Task dispatcher panicked");
            }
        }
        info!("Task queue stopped");
    }
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(&self, task: PipelineTask) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .await
            .clone()
            .ok_or(OperatorError::QueueClosed)?;
        debug!(workflow = %task.workflow(), repository = task.repository(), "Enqueueing task");
        sender
            .send(task)
            .await
            .map_err(|_| OperatorError::QueueClosed)
    }
}

impl std::fmt::Debug for LocalTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTaskQueue")
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

async fn dispatch(
    orchestrator: Arc<Orchestrator>,
    mut receiver: mpsc::Receiver<PipelineTask>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));

    while let Some(task) = receiver.recv().await {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Worker semaphore closed, dropping task");
                break;
            }
        };
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let run = execute(&orchestrator, &task).await;
            info!(
                run_id = %run.id,
                workflow = %run.workflow,
                status = %run.status,
                "Task finished"
            );
            drop(permit);
        });
    }

    // drain: every permit back means every spawned task finished
    let Ok(workers) = u32::try_from(workers) else {
        return;
    };
    if permits.acquire_many(workers).await.is_err() {
        warn!("Worker semaphore closed while draining");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TagEvent;
    use crate::notify::STAGE_FAILED_EVENT;
    use crate::testing::{FakeTransfer, Harness};

    #[test]
    fn test_task_wire_format() {
        let task = PipelineTask::Convert(MergeEvent::new("climate-kg", "main", "abc123de"));
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "convert");
        assert_eq!(json["repository_id"], "climate-kg");

        let parsed: PipelineTask = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.workflow(), Workflow::Conversion);

        let deploy = PipelineTask::Deploy(DeploymentRequest::new(
            TagEvent::new("climate-kg", "v0.0.1", "abc"),
            "climatekg",
            "1",
            "1Gi",
        ));
        assert_eq!(deploy.repository(), "climate-kg");
    }

    #[tokio::test]
    async fn test_tasks_run_to_completion_before_shutdown() {
        let harness = Harness::new(FakeTransfer::new());
        let queue = LocalTaskQueue::start(harness.orchestrator.clone(), 2);

        for commit in ["c1", "c2", "c3"] {
            queue
                .enqueue(PipelineTask::Convert(MergeEvent::new("climate-kg", "main", commit)))
                .await
                .unwrap();
        }
        queue.shutdown().await;

        // every run failed on missing sources and reported it
        let events = harness.sink.events();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e == STAGE_FAILED_EVENT));
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let harness = Harness::new(FakeTransfer::new());
        let queue = LocalTaskQueue::start(harness.orchestrator.clone(), 1);
        queue.shutdown().await;

        let err = queue
            .enqueue(PipelineTask::Convert(MergeEvent::new("climate-kg", "main", "c1")))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::QueueClosed));
    }
}
