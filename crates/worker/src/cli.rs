use std::time::Duration;

use clap::{Parser, ValueEnum};

use cellfleet_infra::{PostgresSettings, QueueSettings, StoreKind, StoreSettings, WorkerConfig, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Parser, Debug)]
#[command(name = "cellfleet-worker")]
#[command(version)]
#[command(about = "Claims cellular automaton simulations from the backlog and runs them")]
pub struct Args {
    /// Backlog backend: "postgres" or "redis-queue"
    #[arg(long = "store", env = "STORE_KIND", default_value = "postgres")]
    pub store: StoreKind,

    #[arg(long, env = "DB_USER", default_value = "postgres")]
    pub db_user: String,

    #[arg(long, env = "DB_PASSWORD", default_value = "", hide_env_values = true)]
    pub db_password: String,

    #[arg(long, env = "DB_HOST", default_value = "127.0.0.1")]
    pub db_host: String,

    #[arg(long, env = "DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    #[arg(long, env = "DB_NAME", default_value = "cellfleet")]
    pub db_name: String,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub db_max_connections: u32,

    /// Connection string of the managed job queue
    #[arg(long, env = "QUEUE_CONNECTION_STRING", default_value = "redis://127.0.0.1:6379")]
    pub queue_url: String,

    #[arg(long, env = "QUEUE_NAME", default_value = "cellfleet:jobs")]
    pub queue_name: String,

    /// Seconds without a heartbeat after which a claimed job may be taken over
    #[arg(long, env = "LEASE_TIMEOUT_SECS", default_value_t = 30)]
    pub lease_timeout_secs: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL_SECS", default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    /// Pause after finding the backlog empty
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Pause after the memory ceiling denied a claim
    #[arg(long, env = "ADMISSION_BACKOFF_SECS", default_value_t = 3)]
    pub admission_backoff_secs: u64,

    /// Fraction of physical memory above which no new job is claimed
    #[arg(long, env = "MEMORY_CEILING", default_value_t = 0.9)]
    pub memory_ceiling: f64,

    #[arg(long, env = "MAX_CONCURRENT_JOBS", default_value_t = 4)]
    pub max_concurrent_jobs: usize,

    #[arg(long, env = "RECONNECT_BACKOFF_SECS", default_value_t = 5)]
    pub reconnect_backoff_secs: u64,

    #[arg(long, env = "CONNECT_ATTEMPTS", default_value_t = 10)]
    pub connect_attempts: u32,

    /// DEV creates the schema, seeds a demo simulation and tears everything down on exit
    #[arg(long = "env", env = "ENV", value_enum, ignore_case = true, default_value = "PROD")]
    pub environment: Environment,

    /// Defaults to "<hostname>-<uuid>"
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,
}

impl Args {
    pub fn is_dev(&self) -> bool {
        self.environment == Environment::Dev
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let worker_id = match &self.worker_id {
            Some(id) if !id.trim().is_empty() => WorkerId::new(id.trim()),
            _ => {
                let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
                WorkerId::generate(&host)
            }
        };

        WorkerConfig {
            worker_id,
            lease_timeout: Duration::from_secs(self.lease_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            admission_backoff: Duration::from_secs(self.admission_backoff_secs),
            memory_ceiling: self.memory_ceiling,
            max_concurrent_jobs: self.max_concurrent_jobs,
            reconnect_backoff: Duration::from_secs(self.reconnect_backoff_secs),
            connect_attempts: self.connect_attempts,
            dev_mode: self.is_dev(),
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            kind: self.store,
            postgres: PostgresSettings {
                user: self.db_user.clone(),
                password: self.db_password.clone(),
                host: self.db_host.clone(),
                port: self.db_port,
                database: self.db_name.clone(),
                max_connections: self.db_max_connections,
            },
            queue: QueueSettings {
                url: self.queue_url.clone(),
                name: self.queue_name.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_a_valid_production_config() {
        let args = Args::try_parse_from(["cellfleet-worker", "--worker-id", "w1"]).unwrap();
        assert!(!args.is_dev());
        assert_eq!(args.store, StoreKind::Postgres);

        let config = args.worker_config();
        assert_eq!(config.worker_id, WorkerId::new("w1"));
        assert_eq!(config.lease_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
        assert_eq!(args.store_settings().postgres.database, "cellfleet");
    }

    #[test]
    fn env_and_store_flags_parse() {
        let args = Args::try_parse_from([
            "cellfleet-worker",
            "--env",
            "dev",
            "--store",
            "redis-queue",
            "--lease-timeout-secs",
            "60",
        ])
        .unwrap();
        assert!(args.is_dev());
        assert_eq!(args.store, StoreKind::RedisQueue);
        assert!(args.worker_config().dev_mode);
        assert_eq!(args.worker_config().lease_timeout, Duration::from_secs(60));
    }

    #[test]
    fn unknown_store_is_rejected() {
        assert!(Args::try_parse_from(["cellfleet-worker", "--store", "sqlite"]).is_err());
    }
}
