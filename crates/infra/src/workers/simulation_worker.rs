//! The per-process worker loop.
//!
//! One loop per worker process. It waits for admission and a free concurrency slot, claims one
//! job at a time and hands each claimed job to its own task. Workers coordinate only through the
//! backlog's atomic claim.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn, Instrument};

use crate::admission::AdmissionController;
use crate::backlog::BacklogError;
use crate::backoff::BackoffPolicy;
use crate::config::WorkerConfig;
use crate::lease::{Lease, LeaseManager};

use super::job::JobReport;
use super::WorkerContext;

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_claimed: u64,
    pub jobs_processed: u64,
    pub jobs_failed: u64,
    /// Jobs given up without release (lease lost, shutdown, backend unavailable)
    pub jobs_abandoned: u64,
    pub generations_written: u64,
    pub admission_denials: u64,
}

/// Result of one IDLE/CLAIMING round.
#[derive(Debug)]
pub enum ClaimRound {
    /// Memory ceiling exceeded.
    Denied,
    /// Nothing claimable.
    Empty,
    Claimed(Lease),
    Failed(BacklogError),
}

#[derive(Debug)]
pub struct SimulationWorker {
    pub(super) ctx: WorkerContext,
    pub(super) config: WorkerConfig,
    pub(super) leases: LeaseManager,
    admission: AdmissionController,
    stats: Mutex<WorkerStats>,
}

impl SimulationWorker {
    pub fn new(ctx: WorkerContext, config: WorkerConfig, admission: AdmissionController) -> Self {
        let leases = LeaseManager::new(
            ctx.backlog.clone(),
            config.worker_id.clone(),
            config.lease_timeout,
            config.heartbeat_interval,
        );
        Self {
            ctx,
            config,
            leases,
            admission,
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_stats(&self, f: impl FnOnce(&mut WorkerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Ask for admission, then try to claim one job.
    pub async fn claim_round(&self) -> ClaimRound {
        if !self.admission.may_claim() {
            self.update_stats(|s| s.admission_denials += 1);
            return ClaimRound::Denied;
        }
        match self.leases.claim_next().await {
            Ok(Some(lease)) => {
                self.update_stats(|s| s.jobs_claimed += 1);
                ClaimRound::Claimed(lease)
            }
            Ok(None) => ClaimRound::Empty,
            Err(err) => ClaimRound::Failed(err),
        }
    }

    /// Run until the shutdown token is cancelled, then wait for in-flight jobs to wind down.
    pub async fn run(self: Arc<Self>) -> WorkerStats {
        let mut in_flight: JoinSet<JobReport> = JoinSet::new();
        let mut backend_failures = 0u32;

        info!(
            worker = %self.config.worker_id,
            max_concurrent = self.config.max_concurrent_jobs,
            memory_ceiling = self.admission.ceiling(),
            lease_timeout_secs = self.config.lease_timeout.as_secs(),
            "worker started"
        );

        loop {
            if self.ctx.shutdown.is_cancelled() {
                break;
            }

            if in_flight.len() >= self.config.max_concurrent_jobs {
                tokio::select! {
                    _ = self.ctx.shutdown.cancelled() => break,
                    Some(joined) = in_flight.join_next() => {
                        self.record(joined);
                        continue;
                    }
                }
            }

            let resume = match self.claim_round().await {
                ClaimRound::Claimed(lease) => {
                    backend_failures = 0;
                    let span = tracing::info_span!(
                        "job",
                        job_id = %lease.job.id,
                        simulation_id = %lease.job.simulation_id
                    );
                    let worker = Arc::clone(&self);
                    in_flight.spawn(async move { worker.drive(lease).await }.instrument(span));
                    true
                }
                ClaimRound::Denied => {
                    let policy = self.config.admission_policy();
                    self.pause(policy, 1, &mut in_flight).await
                }
                ClaimRound::Empty => {
                    backend_failures = 0;
                    let policy = self.config.poll_policy();
                    self.pause(policy, 1, &mut in_flight).await
                }
                ClaimRound::Failed(err) => {
                    backend_failures = backend_failures.saturating_add(1);
                    if err.is_transient() {
                        warn!(error = %err, attempt = backend_failures, "claim failed, backing off");
                    } else {
                        error!(error = %err, attempt = backend_failures, "claim failed");
                    }
                    let policy = self.config.transient_policy();
                    self.pause(policy, backend_failures, &mut in_flight).await
                }
            };
            if !resume {
                break;
            }
        }

        info!(in_flight = in_flight.len(), "worker stopping, waiting for in-flight jobs");
        while let Some(joined) = in_flight.join_next().await {
            self.record(joined);
        }

        let stats = self.stats();
        info!(?stats, "worker stopped");
        stats
    }

    /// Sleep through a backoff while reaping finished jobs. Returns `false` on shutdown.
    async fn pause(
        &self,
        policy: BackoffPolicy,
        attempt: u32,
        in_flight: &mut JoinSet<JobReport>,
    ) -> bool {
        let sleep = tokio::time::sleep(policy.delay_for_attempt(attempt));
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = self.ctx.shutdown.cancelled() => return false,
                _ = &mut sleep => return true,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.record(joined);
                }
            }
        }
    }

    fn record(&self, joined: Result<JobReport, JoinError>) {
        let report = match joined {
            Ok(report) => report,
            Err(err) => {
                error!(error = %err, "job task ended abnormally");
                self.update_stats(|s| s.jobs_abandoned += 1);
                return;
            }
        };

        self.update_stats(|s| {
            s.generations_written += report.generations_written;
            match &report.result {
                Ok(()) => s.jobs_processed += 1,
                Err(failure) if failure.release_outcome().is_some() => s.jobs_failed += 1,
                Err(_) => s.jobs_abandoned += 1,
            }
        });
    }
}
