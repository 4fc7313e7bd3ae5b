//! Postgres-backed backlog, simulation catalog and checkpoint store.
//!
//! Claiming is a single conditional `UPDATE` over a `FOR UPDATE SKIP LOCKED` subselect, so two
//! workers polling at the same instant never receive the same row. Lease expiry is computed with
//! the database clock (`now()`), never the worker's.
//!
//! ## Error Mapping
//!
//! | SQLx error | Postgres code | Mapped to |
//! |---|---|---|
//! | Database (unique violation) | `23505` | `CheckpointError::Conflict` on checkpoint append |
//! | Database (foreign key violation) | `23503` | `BacklogError::UnknownSimulation` on enqueue |
//! | Database (serialization, deadlock, lock timeout, admin shutdown) | `40001`, `40P01`, `55P03`, `57P0x` | `Unavailable` |
//! | Database (connection exception) | `08xxx` | `Unavailable` |
//! | Io / PoolTimedOut / PoolClosed / WorkerCrashed | N/A | `Unavailable` |
//! | Anything else | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use cellfleet_core::{
    encode_rule_set, parse_rule_set, Generation, Job, JobId, NewSimulation, OwnerId, Simulation,
    SimulationId, SimulationStatus,
};

use crate::backlog::{validate_target, Backlog, BacklogError};
use crate::catalog::{CatalogError, SimulationCatalog};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::lease::{JobOutcome, Lease, LeaseToken, WorkerId};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Open a pool and verify it with one round trip.
    pub async fn connect(
        options: PgConnectOptions,
        max_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Backlog for PostgresStore {
    #[instrument(skip(self), fields(simulation_id = %simulation_id), err)]
    async fn enqueue(
        &self,
        simulation_id: SimulationId,
        target_generation_count: u64,
    ) -> Result<Job, BacklogError> {
        validate_target(target_generation_count)?;

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (simulation_id, target_generation_count, last_activity)
            VALUES ($1, $2, $3)
            RETURNING id, simulation_id, target_generation_count, last_activity
            "#,
        )
        .bind(simulation_id.get())
        .bind(target_generation_count as i64)
        .bind(DateTime::<Utc>::UNIX_EPOCH)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| match map_sqlx_error("enqueue", e) {
            SqlFailure::ForeignKey(_) => BacklogError::UnknownSimulation(simulation_id),
            other => other.into(),
        })?;

        job_from_row(&row)
    }

    #[instrument(skip(self), fields(worker = %owner), err)]
    async fn claim_next(
        &self,
        owner: &WorkerId,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, BacklogError> {
        let token = LeaseToken::new();

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET last_activity = now(), lease_token = $1, claimed_by = $2
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE last_activity < now() - make_interval(secs => $3)
                ORDER BY last_activity ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, simulation_id, target_generation_count, last_activity
            "#,
        )
        .bind(token.as_uuid())
        .bind(owner.as_str())
        .bind(lease_timeout.as_secs_f64())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| BacklogError::from(map_sqlx_error("claim_next", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = job_from_row(&row)?;
        debug!(job_id = %job.id, "claimed job row");

        Ok(Some(Lease {
            claimed_at: job.last_activity,
            job,
            token,
            owner: owner.clone(),
            timeout: lease_timeout,
        }))
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job.id), err)]
    async fn renew(&self, lease: &Lease) -> Result<(), BacklogError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET last_activity = now()
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(lease.job.id.get())
        .bind(lease.token.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| BacklogError::from(map_sqlx_error("renew", e)))?;

        if result.rows_affected() == 0 {
            return Err(BacklogError::LeaseLost(lease.job.id));
        }
        Ok(())
    }

    /// Delete the job and set the simulation status in one transaction.
    #[instrument(skip(self, lease), fields(job_id = %lease.job.id), err)]
    async fn release(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), BacklogError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BacklogError::from(map_sqlx_error("release_begin", e)))?;

        let deleted = sqlx::query("DELETE FROM jobs WHERE id = $1 AND lease_token = $2")
            .bind(lease.job.id.get())
            .bind(lease.token.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| BacklogError::from(map_sqlx_error("release_delete", e)))?;
        if deleted.rows_affected() == 0 {
            // Dropping the transaction rolls it back.
            return Err(BacklogError::LeaseLost(lease.job.id));
        }

        let updated = sqlx::query("UPDATE simulations SET status = $1 WHERE id = $2")
            .bind(outcome.terminal_status().as_str())
            .bind(lease.job.simulation_id.get())
            .execute(&mut *tx)
            .await
            .map_err(|e| BacklogError::from(map_sqlx_error("release_status", e)))?;
        if updated.rows_affected() == 0 {
            return Err(BacklogError::UnknownSimulation(lease.job.simulation_id));
        }

        tx.commit()
            .await
            .map_err(|e| BacklogError::from(map_sqlx_error("release_commit", e)))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>, BacklogError> {
        let rows = sqlx::query(
            r#"
            SELECT id, simulation_id, target_generation_count, last_activity
            FROM jobs
            ORDER BY last_activity ASC, id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| BacklogError::from(map_sqlx_error("list_jobs", e)))?;

        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl SimulationCatalog for PostgresStore {
    #[instrument(skip(self, simulation), fields(name = %simulation.name), err)]
    async fn create(&self, simulation: NewSimulation) -> Result<Simulation, CatalogError> {
        simulation
            .validate()
            .map_err(|e| CatalogError::Rejected(e.to_string()))?;
        let rule_set =
            encode_rule_set(&simulation.rules).map_err(|e| CatalogError::Rejected(e.to_string()))?;

        let row = sqlx::query(
            r#"
            INSERT INTO simulations
                (owner_id, name, description, width, height, state_count, rule_set, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(simulation.owner.get())
        .bind(&simulation.name)
        .bind(simulation.description.as_deref())
        .bind(simulation.width as i32)
        .bind(simulation.height as i32)
        .bind(i32::from(simulation.state_count))
        .bind(&rule_set)
        .bind(SimulationStatus::Pending.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| CatalogError::from(map_sqlx_error("create_simulation", e)))?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| CatalogError::Storage(format!("failed to read simulation id: {e}")))?;
        Ok(simulation.into_simulation(SimulationId::new(id)))
    }

    #[instrument(skip(self), fields(simulation_id = %id), err)]
    async fn load(&self, id: SimulationId) -> Result<Simulation, CatalogError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, name, description, width, height, state_count, rule_set, status
            FROM simulations
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| CatalogError::from(map_sqlx_error("load_simulation", e)))?
        .ok_or(CatalogError::NotFound(id))?;

        let raw = SimulationRow::try_from(&row)
            .map_err(|e| CatalogError::Storage(format!("failed to read simulation row: {e}")))?;
        raw.into_simulation()
    }

    #[instrument(skip(self), fields(simulation_id = %id), err)]
    async fn set_status(
        &self,
        id: SimulationId,
        status: SimulationStatus,
    ) -> Result<(), CatalogError> {
        let result = sqlx::query("UPDATE simulations SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id.get())
            .execute(&*self.pool)
            .await
            .map_err(|e| CatalogError::from(map_sqlx_error("set_status", e)))?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PostgresStore {
    #[instrument(skip(self), fields(simulation_id = %simulation_id), err)]
    async fn load_latest(&self, simulation_id: SimulationId) -> Result<Generation, CheckpointError> {
        let row = sqlx::query(
            r#"
            SELECT iteration, content
            FROM generations
            WHERE simulation_id = $1
            ORDER BY iteration DESC
            LIMIT 1
            "#,
        )
        .bind(simulation_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| CheckpointError::from(map_sqlx_error("load_latest", e)))?
        .ok_or(CheckpointError::MissingSeed(simulation_id))?;

        let iteration: i64 = row
            .try_get("iteration")
            .map_err(|e| CheckpointError::Storage(format!("failed to read iteration: {e}")))?;
        let content: Vec<u8> = row
            .try_get("content")
            .map_err(|e| CheckpointError::Storage(format!("failed to read content: {e}")))?;

        Ok(Generation {
            simulation_id,
            iteration: u64::try_from(iteration).map_err(|_| {
                CheckpointError::Storage(format!("negative iteration {iteration}"))
            })?,
            content,
        })
    }

    #[instrument(skip(self, content), fields(simulation_id = %simulation_id, bytes = content.len()), err)]
    async fn append(
        &self,
        simulation_id: SimulationId,
        iteration: u64,
        content: &[u8],
    ) -> Result<(), CheckpointError> {
        let stored_iteration = i64::try_from(iteration)
            .map_err(|_| CheckpointError::Storage(format!("iteration {iteration} out of range")))?;

        let conflict = CheckpointError::Conflict {
            simulation_id,
            iteration,
        };
        let inserted = sqlx::query(
            r#"
            INSERT INTO generations (simulation_id, iteration, content)
            SELECT $1, $2, $3
            WHERE NOT EXISTS (
                SELECT 1 FROM generations WHERE simulation_id = $1 AND iteration >= $2
            )
            "#,
        )
        .bind(simulation_id.get())
        .bind(stored_iteration)
        .bind(content)
        .execute(&*self.pool)
        .await
        .map_err(|e| match map_sqlx_error("append_generation", e) {
            SqlFailure::Unique(_) => conflict.clone(),
            other => other.into(),
        })?;

        if inserted.rows_affected() == 0 {
            return Err(conflict);
        }
        Ok(())
    }

    async fn list_iterations(
        &self,
        simulation_id: SimulationId,
    ) -> Result<Vec<u64>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT iteration FROM generations WHERE simulation_id = $1 ORDER BY iteration ASC",
        )
        .bind(simulation_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| CheckpointError::from(map_sqlx_error("list_iterations", e)))?;

        rows.iter()
            .map(|row| {
                row.try_get::<i64, _>("iteration")
                    .map(|i| i as u64)
                    .map_err(|e| CheckpointError::Storage(format!("failed to read iteration: {e}")))
            })
            .collect()
    }
}

// SQLx row types

fn job_from_row(row: &PgRow) -> Result<Job, BacklogError> {
    let read = |e: sqlx::Error| BacklogError::Storage(format!("failed to read job row: {e}"));
    let target: i64 = row.try_get("target_generation_count").map_err(read)?;
    Ok(Job {
        id: JobId::new(row.try_get("id").map_err(read)?),
        simulation_id: SimulationId::new(row.try_get("simulation_id").map_err(read)?),
        target_generation_count: u64::try_from(target)
            .map_err(|_| BacklogError::Storage(format!("negative target {target}")))?,
        last_activity: row.try_get("last_activity").map_err(read)?,
    })
}

#[derive(Debug)]
struct SimulationRow {
    id: i64,
    owner_id: i64,
    name: String,
    description: Option<String>,
    width: i32,
    height: i32,
    state_count: i32,
    rule_set: String,
    status: String,
}

impl TryFrom<&PgRow> for SimulationRow {
    type Error = sqlx::Error;

    fn try_from(row: &PgRow) -> Result<Self, Self::Error> {
        Ok(SimulationRow {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            width: row.try_get("width")?,
            height: row.try_get("height")?,
            state_count: row.try_get("state_count")?,
            rule_set: row.try_get("rule_set")?,
            status: row.try_get("status")?,
        })
    }
}

impl SimulationRow {
    /// Decode the stored definition. Undecodable rows are data integrity errors.
    fn into_simulation(self) -> Result<Simulation, CatalogError> {
        let id = SimulationId::new(self.id);
        let invalid = |reason: String| CatalogError::Invalid { id, reason };

        let width = u32::try_from(self.width)
            .map_err(|_| invalid(format!("width {} out of range", self.width)))?;
        let height = u32::try_from(self.height)
            .map_err(|_| invalid(format!("height {} out of range", self.height)))?;
        let state_count = u16::try_from(self.state_count)
            .map_err(|_| invalid(format!("state count {} out of range", self.state_count)))?;
        let rules = parse_rule_set(&self.rule_set).map_err(|e| invalid(e.to_string()))?;
        let status = self
            .status
            .parse::<SimulationStatus>()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Simulation {
            id,
            owner: OwnerId::new(self.owner_id),
            name: self.name,
            description: self.description,
            width,
            height,
            state_count,
            rules,
            status,
        })
    }
}

/// Classified SQLx failure; see the module docs for the mapping table.
#[derive(Debug)]
enum SqlFailure {
    Unique(String),
    ForeignKey(String),
    Transient(String),
    Other(String),
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SqlFailure {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => SqlFailure::Unique(msg),
                Some("23503") => SqlFailure::ForeignKey(msg),
                Some("40001" | "40P01" | "55P03" | "57P01" | "57P02" | "57P03") => {
                    SqlFailure::Transient(msg)
                }
                Some(code) if code.starts_with("08") => SqlFailure::Transient(msg),
                _ => SqlFailure::Other(msg),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => {
            SqlFailure::Transient(format!("connection failure in {}: {}", operation, err))
        }
        _ => SqlFailure::Other(format!("sqlx error in {}: {}", operation, err)),
    }
}

impl From<SqlFailure> for BacklogError {
    fn from(failure: SqlFailure) -> Self {
        match failure {
            SqlFailure::Transient(msg) => BacklogError::Unavailable(msg),
            SqlFailure::Unique(msg) | SqlFailure::ForeignKey(msg) | SqlFailure::Other(msg) => {
                BacklogError::Storage(msg)
            }
        }
    }
}

impl From<SqlFailure> for CatalogError {
    fn from(failure: SqlFailure) -> Self {
        match failure {
            SqlFailure::Transient(msg) => CatalogError::Unavailable(msg),
            SqlFailure::Unique(msg) | SqlFailure::ForeignKey(msg) | SqlFailure::Other(msg) => {
                CatalogError::Storage(msg)
            }
        }
    }
}

impl From<SqlFailure> for CheckpointError {
    fn from(failure: SqlFailure) -> Self {
        match failure {
            SqlFailure::Transient(msg) => CheckpointError::Unavailable(msg),
            SqlFailure::Unique(msg) | SqlFailure::ForeignKey(msg) | SqlFailure::Other(msg) => {
                CheckpointError::Storage(msg)
            }
        }
    }
}
