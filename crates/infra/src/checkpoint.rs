//! Generation checkpoints.
//!
//! Iteration 0 is the seed written at submission time. A worker resumes from the highest stored
//! iteration and appends one row per computed generation; rows are never updated or deleted.

use async_trait::async_trait;

use cellfleet_core::{Generation, SimulationId};

#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Highest-iteration generation of the simulation.
    async fn load_latest(&self, simulation_id: SimulationId) -> Result<Generation, CheckpointError>;

    /// Persist one generation. Iterations are strictly increasing per simulation; an iteration at
    /// or below the latest stored one is a `Conflict`.
    async fn append(
        &self,
        simulation_id: SimulationId,
        iteration: u64,
        content: &[u8],
    ) -> Result<(), CheckpointError>;

    /// Stored iterations in ascending order.
    async fn list_iterations(&self, simulation_id: SimulationId)
    -> Result<Vec<u64>, CheckpointError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointError {
    #[error("simulation {0} has no stored generation")]
    MissingSeed(SimulationId),

    #[error("generation {iteration} of simulation {simulation_id} is not past the latest stored one")]
    Conflict {
        simulation_id: SimulationId,
        iteration: u64,
    },

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CheckpointError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CheckpointError::Unavailable(_))
    }
}
