//! Typed worker configuration.
//!
//! The binary parses flags and environment variables with clap and hands the result over as a
//! [`WorkerConfig`] plus [`StoreSettings`]; nothing in this crate reads the environment itself.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

use crate::backoff::BackoffPolicy;
use crate::lease::WorkerId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("heartbeat interval {heartbeat:?} must be shorter than the lease timeout {lease:?}")]
    HeartbeatTooSlow { heartbeat: Duration, lease: Duration },

    #[error("memory ceiling {0} must be within (0, 1]")]
    CeilingOutOfRange(f64),

    #[error("max concurrent jobs must be positive")]
    ZeroConcurrency,

    #[error("{0} must be positive")]
    ZeroDuration(&'static str),

    #[error("development mode refuses non-loopback store host '{0}'")]
    RemoteDevHost(String),

    #[error("unknown store kind '{0}' (expected 'postgres' or 'redis-queue')")]
    UnknownStore(String),
}

/// Runtime parameters of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub lease_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Wait after an empty claim
    pub poll_interval: Duration,
    /// Wait after an admission denial
    pub admission_backoff: Duration,
    /// Used/total memory ratio above which no new job is claimed
    pub memory_ceiling: f64,
    pub max_concurrent_jobs: usize,
    pub reconnect_backoff: Duration,
    pub connect_attempts: u32,
    pub dev_mode: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::generate("worker"),
            lease_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            admission_backoff: Duration::from_secs(3),
            memory_ceiling: 0.90,
            max_concurrent_jobs: 4,
            reconnect_backoff: Duration::from_secs(5),
            connect_attempts: 10,
            dev_mode: false,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("lease timeout", self.lease_timeout),
            ("heartbeat interval", self.heartbeat_interval),
            ("poll interval", self.poll_interval),
            ("admission backoff", self.admission_backoff),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.heartbeat_interval >= self.lease_timeout {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                lease: self.lease_timeout,
            });
        }
        if !(self.memory_ceiling > 0.0 && self.memory_ceiling <= 1.0) {
            return Err(ConfigError::CeilingOutOfRange(self.memory_ceiling));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }

    pub fn poll_policy(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(self.poll_interval)
    }

    pub fn admission_policy(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(self.admission_backoff)
    }

    /// Consecutive transient backend failures back off exponentially up to the poll interval.
    pub fn transient_policy(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            Duration::from_secs(1).min(self.poll_interval),
            self.poll_interval,
        )
    }

    pub fn reconnect_policy(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(self.reconnect_backoff)
    }
}

/// Which backend holds the job backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreKind {
    #[default]
    Postgres,
    RedisQueue,
}

impl FromStr for StoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreKind::Postgres),
            "redis-queue" | "redis" => Ok(StoreKind::RedisQueue),
            other => Err(ConfigError::UnknownStore(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresSettings {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub max_connections: u32,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: String::new(),
            host: "127.0.0.1".to_string(),
            port: 5432,
            database: "cellfleet".to_string(),
            max_connections: 10,
        }
    }
}

impl PostgresSettings {
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database);
        if self.password.is_empty() {
            options
        } else {
            options.password(&self.password)
        }
    }

    pub fn is_loopback(&self) -> bool {
        is_loopback_host(&self.host)
    }
}

fn is_loopback_host(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost")
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub url: String,
    pub name: String,
}

impl QueueSettings {
    /// Host part of the connection string, e.g. `cache.internal` for
    /// `redis://user:pw@cache.internal:6379/0`. Unix sockets report `localhost`.
    pub fn host(&self) -> Option<&str> {
        let (scheme, rest) = self.url.split_once("://")?;
        if scheme.ends_with("+unix") || scheme == "unix" {
            return Some("localhost");
        }
        let authority = rest.split(['/', '?']).next().unwrap_or_default();
        let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
        let host = if authority.starts_with('[') {
            authority.split_once(']').map_or(authority, |(host, _)| host)
        } else {
            authority.split(':').next().unwrap_or_default()
        };
        let host = host.trim_start_matches('[');
        (!host.is_empty()).then_some(host)
    }

    pub fn is_loopback(&self) -> bool {
        self.host().is_some_and(is_loopback_host)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            name: "cellfleet:jobs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
    pub kind: StoreKind,
    pub postgres: PostgresSettings,
    pub queue: QueueSettings,
}

impl StoreSettings {
    /// Development mode creates and drops tables and purges the queue, so it only ever talks to
    /// local stores.
    pub fn check_dev_mode(&self) -> Result<(), ConfigError> {
        if !self.postgres.is_loopback() {
            return Err(ConfigError::RemoteDevHost(self.postgres.host.clone()));
        }
        if self.kind == StoreKind::RedisQueue && !self.queue.is_loopback() {
            let host = self.queue.host().unwrap_or("<unparsable queue url>");
            return Err(ConfigError::RemoteDevHost(host.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = WorkerConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.lease_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_concurrent_jobs, 4);
        assert!(cfg.worker_id.as_str().starts_with("worker-"));
    }

    #[test]
    fn heartbeat_must_be_shorter_than_lease() {
        let cfg = WorkerConfig {
            heartbeat_interval: Duration::from_secs(30),
            ..WorkerConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::HeartbeatTooSlow { .. })
        ));
    }

    #[test]
    fn ceiling_and_concurrency_are_checked() {
        for ceiling in [0.0, -0.1, 1.01, f64::NAN] {
            let cfg = WorkerConfig {
                memory_ceiling: ceiling,
                ..WorkerConfig::default()
            };
            assert!(matches!(cfg.validate(), Err(ConfigError::CeilingOutOfRange(_))));
        }

        let cfg = WorkerConfig {
            max_concurrent_jobs: 0,
            ..WorkerConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroConcurrency));
    }

    #[test]
    fn store_kind_parses() {
        assert_eq!("postgres".parse::<StoreKind>().unwrap(), StoreKind::Postgres);
        assert_eq!("Redis-Queue".parse::<StoreKind>().unwrap(), StoreKind::RedisQueue);
        assert!("mysql".parse::<StoreKind>().is_err());
    }

    #[test]
    fn dev_mode_requires_loopback_database() {
        let mut settings = StoreSettings::default();
        settings.check_dev_mode().unwrap();

        settings.postgres.host = "localhost".to_string();
        settings.check_dev_mode().unwrap();

        settings.postgres.host = "::1".to_string();
        settings.check_dev_mode().unwrap();

        settings.postgres.host = "db.internal".to_string();
        assert!(matches!(
            settings.check_dev_mode(),
            Err(ConfigError::RemoteDevHost(_))
        ));
    }

    #[test]
    fn dev_mode_requires_loopback_queue() {
        let mut settings = StoreSettings {
            kind: StoreKind::RedisQueue,
            ..StoreSettings::default()
        };
        settings.check_dev_mode().unwrap();

        for url in [
            "redis://localhost:6379",
            "redis://:secret@[::1]:6379/0",
            "redis+unix:///var/run/redis.sock",
        ] {
            settings.queue.url = url.to_string();
            settings.check_dev_mode().unwrap();
        }

        for url in [
            "redis://prod-queue.example.com:6379",
            "rediss://user:pw@10.0.4.2:6380/1",
            "not a url",
        ] {
            settings.queue.url = url.to_string();
            assert!(
                matches!(settings.check_dev_mode(), Err(ConfigError::RemoteDevHost(_))),
                "{url}"
            );
        }

        // The queue is irrelevant when the backlog lives in Postgres.
        settings.kind = StoreKind::Postgres;
        settings.check_dev_mode().unwrap();
    }

    #[test]
    fn queue_host_is_extracted_from_the_url() {
        let queue = |url: &str| QueueSettings {
            url: url.to_string(),
            name: "q".to_string(),
        };
        assert_eq!(queue("redis://127.0.0.1:6379").host(), Some("127.0.0.1"));
        assert_eq!(queue("redis://u:p@cache.internal/0").host(), Some("cache.internal"));
        assert_eq!(queue("redis://[::1]:6379").host(), Some("::1"));
        assert_eq!(queue("cache.internal:6379").host(), None);
    }
}
