//! Hierarchical configuration: TOML file, then environment variables,
//! then CLI flags — each layer overriding the previous one. Mirrors the
//! coordinator's config sections from the system spec: `database`,
//! `web`, `broker`, `scheduler`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("missing required setting {field} (set it in the config file or via {env_var})")]
    Missing {
        field: &'static str,
        env_var: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub web: WebConfig,
    pub broker: BrokerConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub dsn: String,
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_address: SocketAddr,
    pub download_path: PathBuf,
    pub upload_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub encode_request_queue: String,
    pub encode_events_queue: String,
    pub pgs_request_queue: String,
    pub pgs_response_queue: String,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub schedule_time: Duration,
    pub job_timeout: Duration,
    /// How long the event-ingestion loop keeps draining `encode.events`
    /// after shutdown is signalled, before it gives up on the remaining
    /// backlog and lets the process exit (§5 Cancellation).
    pub shutdown_grace: Duration,
    /// Maximum rows `select_schedulable` claims in a single tick.
    pub batch_size: i64,
}

/// The on-disk / env shape, every field optional so each layer can
/// supply only what it overrides.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database: Option<FileDatabaseConfig>,
    web: Option<FileWebConfig>,
    broker: Option<FileBrokerConfig>,
    scheduler: Option<FileSchedulerConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct FileDatabaseConfig {
    dsn: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileWebConfig {
    bind_address: Option<String>,
    download_path: Option<PathBuf>,
    upload_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct FileBrokerConfig {
    url: Option<String>,
    encode_request_queue: Option<String>,
    encode_events_queue: Option<String>,
    pgs_request_queue: Option<String>,
    pgs_response_queue: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileSchedulerConfig {
    schedule_time: Option<String>,
    job_timeout: Option<String>,
    shutdown_grace: Option<String>,
    batch_size: Option<i64>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(err) => return Err(ConfigError::Invalid { field: ".env", message: err.to_string() }),
        }

        let file = self.load_file()?;

        let dsn = env_or("TRANSCODIS_DATABASE_DSN")
            .or(file.database.and_then(|d| d.dsn))
            .ok_or(ConfigError::Missing {
                field: "database.dsn",
                env_var: "TRANSCODIS_DATABASE_DSN",
            })?;

        let web_file = file.web.unwrap_or_default();
        let bind_address: SocketAddr = env_or("TRANSCODIS_WEB_BIND_ADDRESS")
            .or(web_file.bind_address)
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .map_err(|e| ConfigError::Invalid { field: "web.bind_address", message: format!("{e}") })?;
        let download_path = env_path("TRANSCODIS_WEB_DOWNLOAD_PATH")
            .or(web_file.download_path)
            .ok_or(ConfigError::Missing { field: "web.download_path", env_var: "TRANSCODIS_WEB_DOWNLOAD_PATH" })?;
        let upload_path = env_path("TRANSCODIS_WEB_UPLOAD_PATH")
            .or(web_file.upload_path)
            .ok_or(ConfigError::Missing { field: "web.upload_path", env_var: "TRANSCODIS_WEB_UPLOAD_PATH" })?;

        let broker_file = file.broker.unwrap_or_default();
        let broker_url = env_or("TRANSCODIS_BROKER_URL")
            .or(broker_file.url)
            .ok_or(ConfigError::Missing { field: "broker.url", env_var: "TRANSCODIS_BROKER_URL" })?;

        let scheduler_file = file.scheduler.unwrap_or_default();
        let schedule_time = parse_duration(
            "scheduler.schedule_time",
            env_or("TRANSCODIS_SCHEDULER_SCHEDULE_TIME")
                .or(scheduler_file.schedule_time)
                .unwrap_or_else(|| "5s".to_string()),
        )?;
        let job_timeout = parse_duration(
            "scheduler.job_timeout",
            env_or("TRANSCODIS_SCHEDULER_JOB_TIMEOUT")
                .or(scheduler_file.job_timeout)
                .unwrap_or_else(|| "30m".to_string()),
        )?;
        let shutdown_grace = parse_duration(
            "scheduler.shutdown_grace",
            env_or("TRANSCODIS_SCHEDULER_SHUTDOWN_GRACE")
                .or(scheduler_file.shutdown_grace)
                .unwrap_or_else(|| "30s".to_string()),
        )?;
        let batch_size = match env_or("TRANSCODIS_SCHEDULER_BATCH_SIZE").or(scheduler_file.batch_size.map(|v| v.to_string())) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|e| ConfigError::Invalid { field: "scheduler.batch_size", message: e.to_string() })?,
            None => 10,
        };

        Ok(Config {
            database: DatabaseConfig { dsn },
            web: WebConfig {
                bind_address,
                download_path,
                upload_path,
            },
            broker: BrokerConfig {
                url: broker_url,
                encode_request_queue: broker_file.encode_request_queue.unwrap_or_else(|| "encode.request".to_string()),
                encode_events_queue: broker_file.encode_events_queue.unwrap_or_else(|| "encode.events".to_string()),
                pgs_request_queue: broker_file.pgs_request_queue.unwrap_or_else(|| "pgs.request".to_string()),
                pgs_response_queue: broker_file.pgs_response_queue.unwrap_or_else(|| "pgs.response".to_string()),
            },
            scheduler: SchedulerConfig {
                schedule_time,
                job_timeout,
                shutdown_grace,
                batch_size,
            },
        })
    }

    fn load_file(&self) -> Result<FileConfig, ConfigError> {
        let candidate = self
            .options
            .config_path
            .clone()
            .or_else(|| default_config_path());

        let Some(path) = candidate else {
            return Ok(FileConfig::default());
        };
        if !path.exists() {
            if self.options.config_path.is_some() {
                return Err(ConfigError::Io {
                    path,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            return Ok(FileConfig::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }
}

fn default_config_path() -> Option<PathBuf> {
    let candidate = Path::new("transcodis-server.toml");
    candidate.exists().then(|| candidate.to_path_buf())
}

fn env_or(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var).ok().map(PathBuf::from)
}

fn parse_duration(field: &'static str, raw: String) -> Result<Duration, ConfigError> {
    humantime::parse_duration(&raw).map_err(|e| ConfigError::Invalid { field, message: e.to_string() })
}
