//! Submission of new simulations: definition, seed generation and backlog job.

use thiserror::Error;
use tracing::{info, instrument};

use cellfleet_core::{Grid, GridError, Job, NewSimulation, Simulation};

use crate::backlog::{Backlog, BacklogError};
use crate::catalog::{CatalogError, SimulationCatalog};
use crate::checkpoint::{CheckpointError, CheckpointStore};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid seed grid: {0}")]
    Seed(#[from] GridError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Backlog(#[from] BacklogError),
}

/// Store `simulation`, write `seed` as generation 0 and enqueue a job for
/// `target_generation_count` generations.
#[instrument(skip_all, fields(name = %simulation.name, target = target_generation_count), err)]
pub async fn submit_simulation(
    catalog: &dyn SimulationCatalog,
    checkpoints: &dyn CheckpointStore,
    backlog: &dyn Backlog,
    simulation: NewSimulation,
    seed: &Grid,
    target_generation_count: u64,
) -> Result<(Simulation, Job), SubmitError> {
    if seed.width() != simulation.width as usize || seed.height() != simulation.height as usize {
        return Err(GridError::LengthMismatch {
            expected: simulation.width as usize * simulation.height as usize,
            actual: seed.width() * seed.height(),
        }
        .into());
    }
    seed.check_states(simulation.state_count)?;

    let simulation = catalog.create(simulation).await?;
    checkpoints.append(simulation.id, 0, &seed.to_bytes()).await?;
    let job = backlog.enqueue(simulation.id, target_generation_count).await?;

    info!(simulation_id = %simulation.id, job_id = %job.id, "simulation submitted");
    Ok((simulation, job))
}
