//! In-memory backend for tests and local runs.
//!
//! All three storage traits share one mutex, so release (delete job + set status) is atomic the
//! same way the Postgres transaction is.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cellfleet_core::{
    Generation, Job, JobId, NewSimulation, Simulation, SimulationId, SimulationStatus,
};

use crate::backlog::{validate_target, Backlog, BacklogError};
use crate::catalog::{CatalogError, SimulationCatalog};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::clock::{Clock, SystemClock};
use crate::lease::{JobOutcome, Lease, LeaseToken, WorkerId};

#[derive(Debug)]
struct JobRow {
    job: Job,
    lease: Option<(LeaseToken, WorkerId)>,
}

#[derive(Debug, Default)]
struct State {
    next_job_id: i64,
    next_simulation_id: i64,
    jobs: HashMap<JobId, JobRow>,
    simulations: HashMap<SimulationId, Simulation>,
    generations: HashMap<SimulationId, BTreeMap<u64, Vec<u8>>>,
}

#[derive(Debug)]
pub struct InMemoryStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full content of one stored generation.
    pub fn generation(&self, simulation_id: SimulationId, iteration: u64) -> Option<Vec<u8>> {
        self.lock()
            .generations
            .get(&simulation_id)
            .and_then(|gens| gens.get(&iteration))
            .cloned()
    }

    /// Insert a job row without checking that the simulation exists.
    #[cfg(test)]
    pub(crate) fn insert_job(
        &self,
        simulation_id: SimulationId,
        target_generation_count: u64,
        last_activity: DateTime<Utc>,
    ) -> Job {
        let mut state = self.lock();
        state.next_job_id += 1;
        let job = Job {
            id: JobId::new(state.next_job_id),
            simulation_id,
            target_generation_count,
            last_activity,
        };
        state.jobs.insert(
            job.id,
            JobRow {
                job: job.clone(),
                lease: None,
            },
        );
        job
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn is_expired(last_activity: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(last_activity) > timeout
}

/// The row still belongs to `lease`.
fn holds(row: &JobRow, lease: &Lease) -> bool {
    matches!(&row.lease, Some((token, _)) if *token == lease.token)
}

#[async_trait]
impl Backlog for InMemoryStore {
    async fn enqueue(
        &self,
        simulation_id: SimulationId,
        target_generation_count: u64,
    ) -> Result<Job, BacklogError> {
        validate_target(target_generation_count)?;
        let mut state = self.lock();
        if !state.simulations.contains_key(&simulation_id) {
            return Err(BacklogError::UnknownSimulation(simulation_id));
        }
        state.next_job_id += 1;
        let job = Job {
            id: JobId::new(state.next_job_id),
            simulation_id,
            target_generation_count,
            last_activity: DateTime::<Utc>::UNIX_EPOCH,
        };
        state.jobs.insert(
            job.id,
            JobRow {
                job: job.clone(),
                lease: None,
            },
        );
        Ok(job)
    }

    async fn claim_next(
        &self,
        owner: &WorkerId,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, BacklogError> {
        let now = self.clock.now();
        let mut state = self.lock();

        let Some(id) = state
            .jobs
            .values()
            .filter(|row| is_expired(row.job.last_activity, now, lease_timeout))
            .min_by_key(|row| (row.job.last_activity, row.job.id))
            .map(|row| row.job.id)
        else {
            return Ok(None);
        };

        let Some(row) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let token = LeaseToken::new();
        row.job.last_activity = now;
        row.lease = Some((token, owner.clone()));

        Ok(Some(Lease {
            job: row.job.clone(),
            token,
            owner: owner.clone(),
            claimed_at: now,
            timeout: lease_timeout,
        }))
    }

    async fn renew(&self, lease: &Lease) -> Result<(), BacklogError> {
        let now = self.clock.now();
        let mut state = self.lock();
        match state.jobs.get_mut(&lease.job.id) {
            Some(row) if holds(row, lease) => {
                row.job.last_activity = now;
                Ok(())
            }
            _ => Err(BacklogError::LeaseLost(lease.job.id)),
        }
    }

    async fn release(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), BacklogError> {
        let mut state = self.lock();
        match state.jobs.get(&lease.job.id) {
            Some(row) if holds(row, lease) => {}
            _ => return Err(BacklogError::LeaseLost(lease.job.id)),
        }

        let simulation_id = lease.job.simulation_id;
        let Some(simulation) = state.simulations.get_mut(&simulation_id) else {
            return Err(BacklogError::UnknownSimulation(simulation_id));
        };
        simulation.status = outcome.terminal_status();
        state.jobs.remove(&lease.job.id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>, BacklogError> {
        let mut jobs: Vec<Job> = self.lock().jobs.values().map(|row| row.job.clone()).collect();
        jobs.sort_by_key(|job| (job.last_activity, job.id));
        Ok(jobs)
    }
}

#[async_trait]
impl SimulationCatalog for InMemoryStore {
    async fn create(&self, simulation: NewSimulation) -> Result<Simulation, CatalogError> {
        simulation
            .validate()
            .map_err(|e| CatalogError::Rejected(e.to_string()))?;
        let mut state = self.lock();
        state.next_simulation_id += 1;
        let simulation = simulation.into_simulation(SimulationId::new(state.next_simulation_id));
        state.simulations.insert(simulation.id, simulation.clone());
        Ok(simulation)
    }

    async fn load(&self, id: SimulationId) -> Result<Simulation, CatalogError> {
        self.lock()
            .simulations
            .get(&id)
            .cloned()
            .ok_or(CatalogError::NotFound(id))
    }

    async fn set_status(
        &self,
        id: SimulationId,
        status: SimulationStatus,
    ) -> Result<(), CatalogError> {
        let mut state = self.lock();
        let simulation = state
            .simulations
            .get_mut(&id)
            .ok_or(CatalogError::NotFound(id))?;
        simulation.status = status;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    async fn load_latest(&self, simulation_id: SimulationId) -> Result<Generation, CheckpointError> {
        let state = self.lock();
        state
            .generations
            .get(&simulation_id)
            .and_then(|gens| gens.last_key_value())
            .map(|(iteration, content)| Generation {
                simulation_id,
                iteration: *iteration,
                content: content.clone(),
            })
            .ok_or(CheckpointError::MissingSeed(simulation_id))
    }

    async fn append(
        &self,
        simulation_id: SimulationId,
        iteration: u64,
        content: &[u8],
    ) -> Result<(), CheckpointError> {
        let mut state = self.lock();
        let gens = state.generations.entry(simulation_id).or_default();
        if gens.last_key_value().is_some_and(|(&last, _)| iteration <= last) {
            return Err(CheckpointError::Conflict {
                simulation_id,
                iteration,
            });
        }
        gens.insert(iteration, content.to_vec());
        Ok(())
    }

    async fn list_iterations(
        &self,
        simulation_id: SimulationId,
    ) -> Result<Vec<u64>, CheckpointError> {
        Ok(self
            .lock()
            .generations
            .get(&simulation_id)
            .map(|gens| gens.keys().copied().collect())
            .unwrap_or_default())
    }
}
