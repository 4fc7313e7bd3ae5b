//! Lease handles and the lease manager that claims, renews and releases them.
//!
//! A lease is the exclusive, time-bounded right of one worker to process one job. Every claim
//! mints a fresh [`LeaseToken`]; renew and release are fenced by it, so a worker whose lease
//! expired and was re-claimed elsewhere gets [`BacklogError::LeaseLost`] instead of clobbering
//! the new owner's progress.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use cellfleet_core::{Job, JobId, SimulationStatus};

use crate::backlog::{Backlog, BacklogError};

/// Identity of a worker process, recorded on the jobs it claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<prefix>-<uuid v7>`.
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-claim fencing handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job: Job,
    pub token: LeaseToken,
    pub owner: WorkerId,
    pub claimed_at: DateTime<Utc>,
    pub timeout: Duration,
}

impl Lease {
    pub fn job_id(&self) -> JobId {
        self.job.id
    }
}

/// How a leased job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

impl JobOutcome {
    pub fn terminal_status(self) -> SimulationStatus {
        match self {
            JobOutcome::Succeeded => SimulationStatus::Processed,
            JobOutcome::Failed => SimulationStatus::Error,
        }
    }
}

/// Claims, renews and releases leases on behalf of one worker.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    backlog: Arc<dyn Backlog>,
    owner: WorkerId,
    lease_timeout: Duration,
    heartbeat_interval: Duration,
}

impl LeaseManager {
    pub fn new(
        backlog: Arc<dyn Backlog>,
        owner: WorkerId,
        lease_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            backlog,
            owner,
            lease_timeout,
            heartbeat_interval,
        }
    }

    /// Atomically take the oldest unclaimed or expired job.
    #[instrument(skip(self), fields(worker = %self.owner), err)]
    pub async fn claim_next(&self) -> Result<Option<Lease>, BacklogError> {
        let lease = self
            .backlog
            .claim_next(&self.owner, self.lease_timeout)
            .await?;
        if let Some(lease) = &lease {
            info!(
                job_id = %lease.job.id,
                simulation_id = %lease.job.simulation_id,
                target = lease.job.target_generation_count,
                token = %lease.token,
                "claimed job"
            );
        }
        Ok(lease)
    }

    pub async fn renew(&self, lease: &Lease) -> Result<(), BacklogError> {
        self.backlog.renew(lease).await
    }

    /// Delete the job and record the terminal status of its simulation.
    #[instrument(skip(self, lease), fields(job_id = %lease.job.id), err)]
    pub async fn release(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), BacklogError> {
        match self.backlog.release(lease, outcome).await {
            Ok(()) => {
                info!(
                    simulation_id = %lease.job.simulation_id,
                    status = %outcome.terminal_status(),
                    "released job"
                );
                Ok(())
            }
            Err(err @ BacklogError::LeaseLost(_)) => {
                warn!(error = %err, "lease was taken over before release");
                Err(err)
            }
            Err(err) => {
                error!(error = %err, "failed to release job");
                Err(err)
            }
        }
    }

    /// Renew `lease` every heartbeat interval until stopped, cancelled or lost.
    ///
    /// The heartbeat task runs on a child of `parent`, so process shutdown stops it too.
    pub fn spawn_heartbeat(&self, lease: &Lease, parent: &CancellationToken) -> Heartbeat {
        let stop = parent.child_token();
        let lost = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_loop(
            self.clone(),
            lease.clone(),
            stop.clone(),
            lost.clone(),
        ));
        Heartbeat { stop, lost, handle }
    }
}

async fn heartbeat_loop(
    manager: LeaseManager,
    lease: Lease,
    stop: CancellationToken,
    lost: CancellationToken,
) {
    let period = manager.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match manager.renew(&lease).await {
            Ok(()) => debug!(job_id = %lease.job.id, "heartbeat renewed lease"),
            Err(BacklogError::LeaseLost(job_id)) => {
                warn!(%job_id, "heartbeat found lease lost");
                lost.cancel();
                break;
            }
            Err(err) => warn!(job_id = %lease.job.id, error = %err, "heartbeat renewal failed"),
        }
    }
}

/// Handle on a running heartbeat task.
#[derive(Debug)]
pub struct Heartbeat {
    stop: CancellationToken,
    lost: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Cancelled when a renewal reported the lease lost.
    pub fn lost_token(&self) -> CancellationToken {
        self.lost.clone()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }

    /// Stop renewing and wait for the task to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "heartbeat task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;

    use cellfleet_core::SimulationId;

    #[test]
    fn outcome_maps_to_terminal_status() {
        assert_eq!(
            JobOutcome::Succeeded.terminal_status(),
            SimulationStatus::Processed
        );
        assert_eq!(JobOutcome::Failed.terminal_status(), SimulationStatus::Error);
    }

    #[test]
    fn tokens_are_unique_per_claim() {
        assert_ne!(LeaseToken::new(), LeaseToken::new());
        let worker = WorkerId::generate("host");
        assert!(worker.as_str().starts_with("host-"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_keeps_the_lease_alive() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        store.insert_job(SimulationId::new(1), 3, DateTime::<Utc>::UNIX_EPOCH);

        let manager = LeaseManager::new(
            store.clone(),
            WorkerId::new("a"),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );
        let lease = manager.claim_next().await.unwrap().unwrap();
        let shutdown = CancellationToken::new();
        let heartbeat = manager.spawn_heartbeat(&lease, &shutdown);

        for _ in 0..5 {
            clock.advance(Duration::from_secs(10));
            tokio::time::sleep(Duration::from_secs(10)).await;
        }

        // 50s after the claim, but renewed every 10s, so nobody else may take it.
        let rival = store
            .claim_next(&WorkerId::new("b"), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(rival.is_none());
        assert!(!heartbeat.is_lost());
        heartbeat.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_reports_a_taken_over_lease() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        store.insert_job(SimulationId::new(1), 3, DateTime::<Utc>::UNIX_EPOCH);

        let manager = LeaseManager::new(
            store.clone(),
            WorkerId::new("a"),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );
        let lease = manager.claim_next().await.unwrap().unwrap();

        clock.advance(Duration::from_secs(31));
        let rival = store
            .claim_next(&WorkerId::new("b"), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(rival.is_some());

        let shutdown = CancellationToken::new();
        let heartbeat = manager.spawn_heartbeat(&lease, &shutdown);
        let lost = heartbeat.lost_token();
        tokio::time::timeout(Duration::from_secs(11), lost.cancelled())
            .await
            .unwrap();
        heartbeat.stop().await;

        let err = manager.release(&lease, JobOutcome::Succeeded).await.unwrap_err();
        assert!(matches!(err, BacklogError::LeaseLost(_)));
    }
}
