//! `cellfleet-core` — simulation domain building blocks.
//!
//! This crate contains **pure domain** code (no storage, transport or runtime concerns):
//! identifiers, backlog/simulation records, the toroidal grid, the rule engine contract and the
//! double-buffered simulation driver.

pub mod driver;
pub mod error;
pub mod grid;
pub mod id;
pub mod model;
pub mod rules;

pub use driver::{DriverError, RunError, SimulationDriver};
pub use error::{DomainError, DomainResult};
pub use grid::{Cell, Grid, GridError, Neighborhood};
pub use id::{JobId, OwnerId, SimulationId};
pub use model::{
    encode_rule_set, parse_rule_set, Generation, Job, NewSimulation, Rule, Simulation,
    SimulationStatus,
};
pub use rules::{ConditionEngine, RuleEngine, RuleError, StepError};
