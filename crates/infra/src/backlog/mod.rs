//! The shared job backlog.
//!
//! Workers never coordinate with each other directly; every piece of cross-worker state lives
//! behind this trait. Implementations:
//!
//! - `store::InMemoryStore` (tests, local demos)
//! - `store::PostgresStore` (polling over a `jobs` table)
//! - `redis_queue::RedisQueueBacklog` (feature `redis`, managed-queue style visibility timeouts)

#[cfg(feature = "redis")]
pub mod redis_queue;

use std::time::Duration;

use async_trait::async_trait;

use cellfleet_core::{Job, JobId, SimulationId};

use crate::lease::{JobOutcome, Lease, WorkerId};

#[async_trait]
pub trait Backlog: Send + Sync + std::fmt::Debug {
    /// Add a job for `simulation_id`. The job is immediately claimable.
    async fn enqueue(
        &self,
        simulation_id: SimulationId,
        target_generation_count: u64,
    ) -> Result<Job, BacklogError>;

    /// Atomically claim the oldest job whose last activity is older than `lease_timeout`.
    ///
    /// Returns `None` when nothing is claimable. Two concurrent callers never receive the same
    /// job.
    async fn claim_next(
        &self,
        owner: &WorkerId,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, BacklogError>;

    /// Push the lease's expiry forward. Fails with `LeaseLost` if the job was deleted or
    /// re-claimed under another token.
    async fn renew(&self, lease: &Lease) -> Result<(), BacklogError>;

    /// Delete the job and set its simulation's terminal status.
    async fn release(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), BacklogError>;

    /// Every job currently in the backlog, claimed or not, oldest activity first.
    async fn list(&self) -> Result<Vec<Job>, BacklogError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BacklogError {
    #[error("lease on job {0} was lost")]
    LeaseLost(JobId),

    #[error("simulation not found: {0}")]
    UnknownSimulation(SimulationId),

    #[error("invalid job: {0}")]
    Invalid(String),

    /// Connection-level or contention failure; retrying later may succeed.
    #[error("backlog unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl BacklogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BacklogError::Unavailable(_))
    }
}

pub(crate) fn validate_target(target_generation_count: u64) -> Result<(), BacklogError> {
    if target_generation_count == 0 {
        return Err(BacklogError::Invalid(
            "target generation count must be positive".to_string(),
        ));
    }
    if i64::try_from(target_generation_count).is_err() {
        return Err(BacklogError::Invalid(format!(
            "target generation count {target_generation_count} is too large"
        )));
    }
    Ok(())
}
