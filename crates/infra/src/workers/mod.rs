//! Worker loop: admission, claim, load, run, release.

pub mod job;
pub mod simulation_worker;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backlog::Backlog;
use crate::catalog::SimulationCatalog;
use crate::checkpoint::CheckpointStore;

pub use job::{JobFailure, JobReport};
pub use simulation_worker::{ClaimRound, SimulationWorker, WorkerStats};

/// Everything a worker talks to. Passed explicitly; there is no global state.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub backlog: Arc<dyn Backlog>,
    pub catalog: Arc<dyn SimulationCatalog>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    /// Process-wide cancellation; every job and heartbeat runs on a child of it.
    pub shutdown: CancellationToken,
}

impl WorkerContext {
    /// Context over a single store implementing all three traits.
    pub fn from_store<S>(store: Arc<S>, shutdown: CancellationToken) -> Self
    where
        S: Backlog + SimulationCatalog + CheckpointStore + 'static,
    {
        Self {
            backlog: store.clone(),
            catalog: store.clone(),
            checkpoints: store,
            shutdown,
        }
    }
}
