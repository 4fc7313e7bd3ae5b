//! Processing of one claimed job: LOADING, RUNNING, then FINALIZING or ABORTING.

use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use cellfleet_core::{
    ConditionEngine, DriverError, JobId, RuleError, RunError, Simulation, SimulationDriver,
    SimulationId, SimulationStatus, StepError,
};

use crate::backlog::BacklogError;
use crate::catalog::CatalogError;
use crate::checkpoint::CheckpointError;
use crate::lease::{JobOutcome, Lease};

use super::simulation_worker::SimulationWorker;

/// Attempts made at loading a job while the backend reports transient errors.
const LOAD_ATTEMPTS: u32 = 3;

/// Why a job did not complete.
#[derive(Debug, Clone, Error)]
pub enum JobFailure {
    /// Malformed rules, undecodable definition, bad or missing seed.
    #[error("data integrity error: {0}")]
    Integrity(String),

    #[error("generation {iteration} failed: {source}")]
    Step { iteration: u64, source: StepError },

    #[error("checkpoint write failed: {0}")]
    Checkpoint(CheckpointError),

    #[error("lease lost")]
    LeaseLost,

    /// The backend stayed unreachable; the job is left for its lease to expire.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("interrupted by shutdown")]
    Interrupted,
}

impl JobFailure {
    /// `Some(Failed)` for failures that end the job with ERROR. Lease loss, shutdown and an
    /// unreachable backend leave the job to expire and be claimed again.
    pub fn release_outcome(&self) -> Option<JobOutcome> {
        match self {
            JobFailure::Integrity(_) | JobFailure::Step { .. } | JobFailure::Checkpoint(_) => {
                Some(JobOutcome::Failed)
            }
            JobFailure::LeaseLost | JobFailure::Unavailable(_) | JobFailure::Interrupted => None,
        }
    }
}

impl From<CatalogError> for JobFailure {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::Unavailable(msg) => JobFailure::Unavailable(msg),
            other => JobFailure::Integrity(other.to_string()),
        }
    }
}

impl From<RuleError> for JobFailure {
    fn from(err: RuleError) -> Self {
        JobFailure::Integrity(err.to_string())
    }
}

impl From<DriverError> for JobFailure {
    fn from(err: DriverError) -> Self {
        JobFailure::Integrity(err.to_string())
    }
}

/// How a job run ended, as seen by the worker loop.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: JobId,
    pub simulation_id: SimulationId,
    pub generations_written: u64,
    pub result: Result<(), JobFailure>,
    /// The job row was deleted and the terminal status recorded.
    pub released: bool,
}

/// Why the emit callback refused a generation.
#[derive(Debug)]
enum EmitError {
    Checkpoint(CheckpointError),
    LeaseLost,
    Interrupted,
}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmitError::Checkpoint(err) => write!(f, "{err}"),
            EmitError::LeaseLost => f.write_str("lease lost"),
            EmitError::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Loaded state of a job, ready to run.
struct Loaded {
    driver: SimulationDriver<ConditionEngine>,
    start: u64,
}

impl SimulationWorker {
    /// Process one claimed job to completion, failure or abandonment.
    pub async fn drive(&self, lease: Lease) -> JobReport {
        let mut report = JobReport {
            job_id: lease.job.id,
            simulation_id: lease.job.simulation_id,
            generations_written: 0,
            result: Ok(()),
            released: false,
        };

        let result = match self.load_with_retry(&lease).await {
            Ok(loaded) => self.run_loaded(&lease, loaded, &mut report).await,
            Err(failure) => Err(failure),
        };

        let outcome = match &result {
            Ok(()) => Some(JobOutcome::Succeeded),
            Err(failure) => {
                if failure.release_outcome().is_some() {
                    error!(error = %failure, "job failed");
                } else {
                    warn!(error = %failure, "job abandoned without release");
                }
                failure.release_outcome()
            }
        };

        if let Some(outcome) = outcome {
            report.released = self.leases.release(&lease, outcome).await.is_ok();
        }
        report.result = result;
        report
    }

    async fn load_with_retry(&self, lease: &Lease) -> Result<Loaded, JobFailure> {
        let policy = self.config.transient_policy();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.load(lease).await {
                Err(JobFailure::Unavailable(reason)) if attempt < LOAD_ATTEMPTS => {
                    warn!(%reason, attempt, "loading job failed, retrying");
                    if !policy.wait(attempt, &self.ctx.shutdown).await {
                        return Err(JobFailure::Interrupted);
                    }
                }
                other => return other,
            }
        }
    }

    /// LOADING: definition, rules and latest checkpoint, then mark the simulation PROCESSING.
    async fn load(&self, lease: &Lease) -> Result<Loaded, JobFailure> {
        let simulation_id = lease.job.simulation_id;
        let simulation: Simulation = self.ctx.catalog.load(simulation_id).await?;
        let engine = ConditionEngine::compile(&simulation.rules, simulation.state_count)?;

        let checkpoint = self
            .ctx
            .checkpoints
            .load_latest(simulation_id)
            .await
            .map_err(|err| match err {
                CheckpointError::Unavailable(msg) => JobFailure::Unavailable(msg),
                other => JobFailure::Integrity(other.to_string()),
            })?;
        let driver = SimulationDriver::from_checkpoint(&simulation, &checkpoint, engine)?;

        if simulation.status != SimulationStatus::Processing {
            self.ctx
                .catalog
                .set_status(simulation_id, SimulationStatus::Processing)
                .await?;
        }

        info!(
            from = checkpoint.iteration,
            target = lease.job.target_generation_count,
            width = simulation.width,
            height = simulation.height,
            "job loaded"
        );
        Ok(Loaded {
            start: checkpoint.iteration,
            driver,
        })
    }

    /// RUNNING: step to the target generation under a heartbeat.
    async fn run_loaded(
        &self,
        lease: &Lease,
        loaded: Loaded,
        report: &mut JobReport,
    ) -> Result<(), JobFailure> {
        let Loaded { mut driver, start } = loaded;
        let target = lease.job.target_generation_count;
        if start >= target {
            debug!(start, target, "checkpoints already reach the target");
            return Ok(());
        }

        let heartbeat = self.leases.spawn_heartbeat(lease, &self.ctx.shutdown);
        let lost = heartbeat.lost_token();
        let shutdown = self.ctx.shutdown.clone();

        let checkpoints = &*self.ctx.checkpoints;
        let leases = &self.leases;
        let simulation_id = lease.job.simulation_id;
        let written = AtomicU64::new(0);
        let (emit_lost, emit_shutdown, emit_written) = (&lost, &shutdown, &written);
        let emit = move |iteration: u64, content: Vec<u8>| async move {
            if emit_lost.is_cancelled() {
                return Err(EmitError::LeaseLost);
            }
            if emit_shutdown.is_cancelled() {
                return Err(EmitError::Interrupted);
            }
            // A lease taken over by another worker must not store this generation.
            match leases.renew(lease).await {
                Ok(()) => {}
                Err(BacklogError::LeaseLost(_)) => return Err(EmitError::LeaseLost),
                Err(err) => warn!(error = %err, iteration, "lease renewal failed"),
            }
            checkpoints
                .append(simulation_id, iteration, &content)
                .await
                .map_err(EmitError::Checkpoint)?;
            emit_written.fetch_add(1, Ordering::Relaxed);
            debug!(iteration, "generation stored");
            tokio::task::yield_now().await;
            Ok(())
        };

        let result = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(JobFailure::Interrupted),
            _ = lost.cancelled() => Err(JobFailure::LeaseLost),
            run = driver.run(start, target, emit) => run.map_err(|err| match err {
                RunError::Step { iteration, source } => JobFailure::Step { iteration, source },
                RunError::Emit { error: EmitError::Checkpoint(err), .. } => JobFailure::Checkpoint(err),
                RunError::Emit { error: EmitError::LeaseLost, .. } => JobFailure::LeaseLost,
                RunError::Emit { error: EmitError::Interrupted, .. } => JobFailure::Interrupted,
                RunError::IterationMismatch { expected, requested } => JobFailure::Integrity(
                    format!("driver at iteration {expected}, run requested from {requested}"),
                ),
            }),
        };

        report.generations_written = written.load(Ordering::Relaxed);
        heartbeat.stop().await;
        result
    }
}
