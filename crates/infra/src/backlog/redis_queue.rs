//! Redis-backed backlog with managed-queue semantics (dequeue with a visibility timeout, update
//! with a pop receipt, delete with a pop receipt).
//!
//! ## Layout
//!
//! - **`{queue}:visible`**: sorted set, member = zero-padded job id, score = last activity (ms,
//!   Redis server clock). A member is claimable when its score is older than the lease timeout.
//! - **`{queue}:bodies`**: hash, job id -> JSON message body.
//! - **`{queue}:receipts`**: hash, job id -> lease token of the current holder.
//! - **`{queue}:seq`**: job id counter.
//!
//! Claim, renew and delete are Lua scripts, so each is atomic on the server. Simulation status
//! lives in the [`SimulationCatalog`] (Postgres), so release is two steps: the fenced delete of
//! the message, then the status update. A crash between the two leaves the simulation in
//! `PROCESSING` with no job.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use cellfleet_core::{Job, JobId, SimulationId};

use crate::backlog::{validate_target, Backlog, BacklogError};
use crate::catalog::{CatalogError, SimulationCatalog};
use crate::lease::{JobOutcome, Lease, LeaseToken, WorkerId};

/// Default queue name
pub const DEFAULT_QUEUE_NAME: &str = "cellfleet:jobs";

const CLAIM_SCRIPT: &str = r#"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local cutoff = now - tonumber(ARGV[1])
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. cutoff, 'LIMIT', 0, 1)
if #ids == 0 then
    return false
end
local id = ids[1]
redis.call('ZADD', KEYS[1], now, id)
redis.call('HSET', KEYS[3], id, ARGV[2])
local body = redis.call('HGET', KEYS[2], id) or ''
return {id, body, now}
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
    return 0
end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
redis.call('ZADD', KEYS[1], 'XX', now, ARGV[1])
return 1
"#;

const DELETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
"#;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueKeys {
    visible: String,
    bodies: String,
    receipts: String,
    seq: String,
}

impl QueueKeys {
    fn new(queue_name: &str) -> Self {
        Self {
            visible: format!("{queue_name}:visible"),
            bodies: format!("{queue_name}:bodies"),
            receipts: format!("{queue_name}:receipts"),
            seq: format!("{queue_name}:seq"),
        }
    }
}

/// Message body stored per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct QueueMessage {
    simulation_id: SimulationId,
    target_generation_count: u64,
}

/// Sorted-set members are zero-padded so lexicographic tie-breaking matches id order.
fn member(id: JobId) -> String {
    format!("{:020}", id.get())
}

fn parse_member(member: &str) -> Result<JobId, BacklogError> {
    member
        .parse::<JobId>()
        .map_err(|e| BacklogError::Storage(format!("bad queue member '{member}': {e}")))
}

/// Decode a message body. The claim script reports a missing body as an empty string.
fn decode_body(id: JobId, body: &str) -> Result<QueueMessage, BacklogError> {
    if body.is_empty() {
        return Err(BacklogError::Storage(format!("missing message body for job {id}")));
    }
    serde_json::from_str(body)
        .map_err(|e| BacklogError::Storage(format!("bad message body for job {id}: {e}")))
}

/// Second half of a release: the message is already gone, record the terminal status.
async fn record_terminal_status(
    catalog: &dyn SimulationCatalog,
    lease: &Lease,
    outcome: JobOutcome,
) -> Result<(), BacklogError> {
    let status = outcome.terminal_status();
    catalog
        .set_status(lease.job.simulation_id, status)
        .await
        .map_err(|err| {
            error!(
                job_id = %lease.job.id,
                simulation_id = %lease.job.simulation_id,
                %status,
                error = %err,
                "message deleted but status not recorded; simulation left PROCESSING without a job"
            );
            map_catalog_error(err)
        })
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub struct RedisQueueBacklog {
    conn: MultiplexedConnection,
    queue_name: String,
    keys: QueueKeys,
    catalog: Arc<dyn SimulationCatalog>,
    claim: Script,
    renew: Script,
    delete: Script,
}

impl fmt::Debug for RedisQueueBacklog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisQueueBacklog")
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}

impl RedisQueueBacklog {
    /// Connect to `redis_url` and verify the connection with a `PING`.
    ///
    /// `catalog` receives the terminal status on release and validates simulations on enqueue.
    pub async fn connect(
        redis_url: impl AsRef<str>,
        queue_name: impl Into<String>,
        catalog: Arc<dyn SimulationCatalog>,
    ) -> Result<Self, BacklogError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BacklogError::Invalid(format!("bad queue connection string: {e}")))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| map_redis_error("ping", e))?;

        let queue_name = queue_name.into();
        info!(queue = %queue_name, "connected to job queue");
        Ok(Self {
            conn,
            keys: QueueKeys::new(&queue_name),
            queue_name,
            catalog,
            claim: Script::new(CLAIM_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            delete: Script::new(DELETE_SCRIPT),
        })
    }

    /// Remove every key of this queue. Development teardown only.
    pub async fn purge(&self) -> Result<(), BacklogError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(vec![
            &self.keys.visible,
            &self.keys.bodies,
            &self.keys.receipts,
            &self.keys.seq,
        ])
        .await
        .map_err(|e| map_redis_error("purge", e))?;
        info!(queue = %self.queue_name, "job queue purged");
        Ok(())
    }
}

#[async_trait]
impl Backlog for RedisQueueBacklog {
    #[instrument(skip(self), fields(queue = %self.queue_name), err)]
    async fn enqueue(
        &self,
        simulation_id: SimulationId,
        target_generation_count: u64,
    ) -> Result<Job, BacklogError> {
        validate_target(target_generation_count)?;
        self.catalog
            .load(simulation_id)
            .await
            .map_err(map_catalog_error)?;

        let body = serde_json::to_string(&QueueMessage {
            simulation_id,
            target_generation_count,
        })
        .map_err(|e| BacklogError::Storage(format!("failed to encode message: {e}")))?;

        let mut conn = self.conn.clone();
        let id: i64 = conn
            .incr(&self.keys.seq, 1)
            .await
            .map_err(|e| map_redis_error("enqueue_seq", e))?;
        let id = JobId::new(id);

        redis::pipe()
            .atomic()
            .hset(&self.keys.bodies, member(id), &body)
            .ignore()
            .zadd(&self.keys.visible, member(id), 0)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| map_redis_error("enqueue", e))?;

        Ok(Job {
            id,
            simulation_id,
            target_generation_count,
            last_activity: DateTime::<Utc>::UNIX_EPOCH,
        })
    }

    #[instrument(skip(self), fields(queue = %self.queue_name, worker = %owner), err)]
    async fn claim_next(
        &self,
        owner: &WorkerId,
        lease_timeout: Duration,
    ) -> Result<Option<Lease>, BacklogError> {
        let token = LeaseToken::new();
        let mut conn = self.conn.clone();

        let claimed: Option<(String, String, i64)> = self
            .claim
            .key(&self.keys.visible)
            .key(&self.keys.bodies)
            .key(&self.keys.receipts)
            .arg(lease_timeout.as_millis() as u64)
            .arg(token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("claim_next", e))?;

        let Some((member, body, now_ms)) = claimed else {
            return Ok(None);
        };
        let id = parse_member(&member)?;
        let message = decode_body(id, &body)?;
        debug!(job_id = %id, "dequeued message");

        let claimed_at = from_millis(now_ms);
        Ok(Some(Lease {
            job: Job {
                id,
                simulation_id: message.simulation_id,
                target_generation_count: message.target_generation_count,
                last_activity: claimed_at,
            },
            token,
            owner: owner.clone(),
            claimed_at,
            timeout: lease_timeout,
        }))
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job.id), err)]
    async fn renew(&self, lease: &Lease) -> Result<(), BacklogError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew
            .key(&self.keys.visible)
            .key(&self.keys.receipts)
            .arg(member(lease.job.id))
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("renew", e))?;

        if renewed == 0 {
            return Err(BacklogError::LeaseLost(lease.job.id));
        }
        Ok(())
    }

    #[instrument(skip(self, lease), fields(job_id = %lease.job.id), err)]
    async fn release(&self, lease: &Lease, outcome: JobOutcome) -> Result<(), BacklogError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .delete
            .key(&self.keys.visible)
            .key(&self.keys.bodies)
            .key(&self.keys.receipts)
            .arg(member(lease.job.id))
            .arg(lease.token.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("release", e))?;

        if deleted == 0 {
            return Err(BacklogError::LeaseLost(lease.job.id));
        }

        record_terminal_status(&*self.catalog, lease, outcome).await
    }

    async fn list(&self) -> Result<Vec<Job>, BacklogError> {
        let mut conn = self.conn.clone();
        let visible: Vec<(String, f64)> = conn
            .zrange_withscores(&self.keys.visible, 0, -1)
            .await
            .map_err(|e| map_redis_error("list", e))?;

        let mut jobs = Vec::with_capacity(visible.len());
        for (member, score) in visible {
            let id = parse_member(&member)?;
            let body: Option<String> = conn
                .hget(&self.keys.bodies, &member)
                .await
                .map_err(|e| map_redis_error("list", e))?;
            let Some(body) = body else { continue };
            let message = decode_body(id, &body)?;
            jobs.push(Job {
                id,
                simulation_id: message.simulation_id,
                target_generation_count: message.target_generation_count,
                last_activity: from_millis(score as i64),
            });
        }
        Ok(jobs)
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> BacklogError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        BacklogError::Unavailable(format!("redis {operation} failed: {err}"))
    } else {
        BacklogError::Storage(format!("redis {operation} failed: {err}"))
    }
}

fn map_catalog_error(err: CatalogError) -> BacklogError {
    match err {
        CatalogError::NotFound(id) => BacklogError::UnknownSimulation(id),
        CatalogError::Unavailable(msg) => BacklogError::Unavailable(msg),
        other => BacklogError::Storage(other.to_string()),
    }
}
