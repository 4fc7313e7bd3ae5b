//! Storage backends implementing [`Backlog`](crate::backlog::Backlog),
//! [`SimulationCatalog`](crate::catalog::SimulationCatalog) and
//! [`CheckpointStore`](crate::checkpoint::CheckpointStore).

pub mod in_memory;
pub mod postgres;
pub mod schema;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
