//! Simulation definitions and their lifecycle status.

use async_trait::async_trait;

use cellfleet_core::{NewSimulation, Simulation, SimulationId, SimulationStatus};

#[async_trait]
pub trait SimulationCatalog: Send + Sync + std::fmt::Debug {
    /// Store a validated simulation with status `Pending`.
    async fn create(&self, simulation: NewSimulation) -> Result<Simulation, CatalogError>;

    async fn load(&self, id: SimulationId) -> Result<Simulation, CatalogError>;

    async fn set_status(
        &self,
        id: SimulationId,
        status: SimulationStatus,
    ) -> Result<(), CatalogError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("simulation not found: {0}")]
    NotFound(SimulationId),

    /// Stored data that cannot be interpreted (bad rule JSON, bad status, bad dimensions).
    #[error("invalid simulation {id}: {reason}")]
    Invalid { id: SimulationId, reason: String },

    #[error("rejected simulation: {0}")]
    Rejected(String),

    #[error("catalog unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Unavailable(_))
    }
}
