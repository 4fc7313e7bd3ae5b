//! Startup connections to the configured backends.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cellfleet_infra::{
    Backlog, PostgresStore, RetryError, StoreKind, StoreSettings, WorkerConfig, WorkerContext,
};

#[cfg(feature = "redis")]
use cellfleet_infra::{backlog::redis_queue::RedisQueueBacklog, SimulationCatalog};

/// Connected backends. Simulations and checkpoints always live in Postgres; the backlog is either
/// the Postgres `jobs` table or the managed queue.
#[derive(Debug)]
pub struct Backends {
    pub postgres: Arc<PostgresStore>,
    #[cfg(feature = "redis")]
    pub queue: Option<Arc<RedisQueueBacklog>>,
}

impl Backends {
    /// Connect with the reconnect policy. `Ok(None)` means shutdown arrived first.
    pub async fn connect(
        settings: &StoreSettings,
        config: &WorkerConfig,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<Option<Self>> {
        #[cfg(not(feature = "redis"))]
        if settings.kind == StoreKind::RedisQueue {
            anyhow::bail!("the redis-queue backlog requires building with the `redis` feature");
        }

        let policy = config.reconnect_policy();
        let options = settings.postgres.connect_options();
        let max_connections = settings.postgres.max_connections;
        let connected = policy
            .retry("connect to postgres", config.connect_attempts, shutdown, || {
                PostgresStore::connect(options.clone(), max_connections)
            })
            .await;
        let postgres = match connected {
            Ok(store) => Arc::new(store),
            Err(RetryError::Cancelled) => return Ok(None),
            Err(err) => {
                return Err(anyhow::Error::new(err)).with_context(|| {
                    format!(
                        "connecting to postgres at {}:{}",
                        settings.postgres.host, settings.postgres.port
                    )
                });
            }
        };
        info!(
            host = %settings.postgres.host,
            database = %settings.postgres.database,
            "connected to postgres"
        );

        #[cfg(feature = "redis")]
        let queue = match settings.kind {
            StoreKind::RedisQueue => {
                let catalog: Arc<dyn SimulationCatalog> = postgres.clone();
                let connected = policy
                    .retry("connect to job queue", config.connect_attempts, shutdown, || {
                        RedisQueueBacklog::connect(
                            settings.queue.url.clone(),
                            settings.queue.name.clone(),
                            catalog.clone(),
                        )
                    })
                    .await;
                match connected {
                    Ok(queue) => Some(Arc::new(queue)),
                    Err(RetryError::Cancelled) => return Ok(None),
                    Err(err) => {
                        return Err(anyhow::Error::new(err)).context("connecting to the job queue");
                    }
                }
            }
            StoreKind::Postgres => None,
        };

        Ok(Some(Self {
            postgres,
            #[cfg(feature = "redis")]
            queue,
        }))
    }

    pub fn backlog(&self) -> Arc<dyn Backlog> {
        #[cfg(feature = "redis")]
        if let Some(queue) = &self.queue {
            return queue.clone();
        }
        self.postgres.clone()
    }

    pub fn context(&self, shutdown: CancellationToken) -> WorkerContext {
        WorkerContext {
            backlog: self.backlog(),
            catalog: self.postgres.clone(),
            checkpoints: self.postgres.clone(),
            shutdown,
        }
    }
}
