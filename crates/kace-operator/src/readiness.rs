//! Readiness Waiter
//!
//! Polls a set of resources with fixed exponential backoff (`d, 2d, 4d, ...`,
//! no jitter) until every one of them exists, carries the expected
//! annotations and, for deployments, reports all replicas available.

use crate::clock::Sleeper;
use crate::cluster::{ClusterApi, ResourceKind, ResourceRef};
use crate::error::{OperatorError, Result};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default retry budget for deployment readiness
pub const DEFAULT_MAX_RETRIES: u32 = 10;

/// What to wait for
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessCheck {
    pub targets: Vec<ResourceRef>,
    pub expected_annotations: BTreeMap<String, String>,
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl ReadinessCheck {
    pub fn new(targets: Vec<ResourceRef>) -> Self {
        Self {
            targets,
            expected_annotations: BTreeMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::from_secs(1),
        }
    }

    pub fn with_annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.expected_annotations = annotations;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Checks actually made; a wait always reads the cluster at least once
    pub fn effective_retries(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay slept after the failed check number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }
}

/// State of one resource at one check
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceObservation {
    pub target: ResourceRef,
    /// `None` when the resource does not exist
    pub annotations: Option<BTreeMap<String, String>>,
    pub available: bool,
}

impl ResourceObservation {
    pub fn exists(&self) -> bool {
        self.annotations.is_some()
    }

    /// Ready when present, annotated as expected and available.
    /// An annotation mismatch is "not ready yet", never an error.
    pub fn is_ready(&self, expected: &BTreeMap<String, String>) -> bool {
        let Some(annotations) = &self.annotations else {
            return false;
        };
        let annotated = expected
            .iter()
            .all(|(key, value)| annotations.get(key) == Some(value));
        annotated && self.available
    }
}

/// Outcome of a full wait
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessReport {
    pub ready: bool,
    pub checks: u32,
    pub delays: Vec<Duration>,
    /// Observations from the last check
    pub observations: Vec<ResourceObservation>,
}

impl ReadinessReport {
    /// Observed annotations per resource, keyed by `Kind/name`
    pub fn observed_annotations(&self) -> BTreeMap<String, Option<BTreeMap<String, String>>> {
        self.observations
            .iter()
            .map(|o| (format!("{}/{}", o.target.kind, o.target.name), o.annotations.clone()))
            .collect()
    }

    /// Error describing an exhausted retry budget
    pub fn timeout_error(&self, target: &str, check: &ReadinessCheck) -> OperatorError {
        OperatorError::ReadinessTimeout {
            target: target.to_string(),
            retries: check.effective_retries(),
            expected: check.expected_annotations.clone(),
            observed: self.observed_annotations(),
        }
    }
}

/// Polls resource status through the cluster API
#[derive(Clone)]
pub struct ReadinessWaiter {
    cluster: Arc<dyn ClusterApi>,
    sleeper: Arc<dyn Sleeper>,
}

impl ReadinessWaiter {
    pub fn new(cluster: Arc<dyn ClusterApi>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { cluster, sleeper }
    }

    /// `true` once every target is ready, `false` when the budget runs out
    pub async fn wait_until_ready(&self, check: &ReadinessCheck) -> Result<bool> {
        Ok(self.wait(check).await?.ready)
    }

    /// Like [`wait_until_ready`](Self::wait_until_ready) but keeps the
    /// observations for error reporting
    #[instrument(skip(self, check), fields(targets = check.targets.len(), max_retries = check.max_retries))]
    pub async fn wait(&self, check: &ReadinessCheck) -> Result<ReadinessReport> {
        let mut report = ReadinessReport {
            ready: false,
            checks: 0,
            delays: Vec::new(),
            observations: Vec::new(),
        };

        for attempt in 0..check.effective_retries() {
            report.observations = self.observe(&check.targets).await?;
            report.checks += 1;

            let pending: Vec<String> = report
                .observations
                .iter()
                .filter(|o| !o.is_ready(&check.expected_annotations))
                .map(|o| o.target.to_string())
                .collect();
            if pending.is_empty() {
                info!(checks = report.checks, "All resources ready");
                report.ready = true;
                return Ok(report);
            }

            let delay = check.delay_for(attempt);
            debug!(attempt, ?delay, ?pending, "Resources not ready, backing off");
            self.sleeper.sleep(delay).await;
            report.delays.push(delay);
        }

        metrics::counter!("kace_readiness_timeouts_total").increment(1);
        warn!(checks = report.checks, "Readiness retries exhausted");
        Ok(report)
    }

    /// Read every target concurrently
    pub async fn observe(&self, targets: &[ResourceRef]) -> Result<Vec<ResourceObservation>> {
        try_join_all(targets.iter().map(|target| self.observe_one(target))).await
    }

    async fn observe_one(&self, target: &ResourceRef) -> Result<ResourceObservation> {
        let live = self
            .cluster
            .get_resource(&target.namespace, target.kind, &target.name)
            .await?;
        let observation = match live {
            Some(resource) => ResourceObservation {
                target: target.clone(),
                annotations: Some(resource.annotations()),
                available: resource.is_available(),
            },
            None => ResourceObservation {
                target: target.clone(),
                annotations: None,
                available: target.kind != ResourceKind::Deployment,
            },
        };
        Ok(observation)
    }
}
