//! Infrastructure layer: backlog, lease management, checkpoints, storage backends and the
//! worker loop.

pub mod admission;
pub mod backlog;
pub mod backoff;
pub mod catalog;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod lease;
pub mod store;
pub mod submit;
pub mod workers;

mod integration_tests;

pub use admission::{AdmissionController, MemoryProbe, SysinfoProbe};
pub use backlog::{Backlog, BacklogError};
pub use backoff::{BackoffPolicy, BackoffStrategy, RetryError};
pub use catalog::{CatalogError, SimulationCatalog};
pub use checkpoint::{CheckpointError, CheckpointStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, PostgresSettings, QueueSettings, StoreKind, StoreSettings, WorkerConfig};
pub use lease::{Heartbeat, JobOutcome, Lease, LeaseManager, LeaseToken, WorkerId};
pub use store::{InMemoryStore, PostgresStore};
pub use submit::{submit_simulation, SubmitError};
pub use workers::{ClaimRound, JobFailure, JobReport, SimulationWorker, WorkerContext, WorkerStats};
