//! Sleep abstraction for poll loops
//!
//! Every polling loop in the operator (job removal, job completion, readiness)
//! suspends through a [`Sleeper`] so tests can observe the exact delay
//! sequence without waiting on the wall clock.

use async_trait::async_trait;
use std::time::Duration;

/// Suspends the calling task for a duration
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
