//! Worker configuration: the `broker` section shared with the
//! coordinator plus worker-specific fields (`max_prefetch_jobs`,
//! `encode_jobs`, `threads`, `temporal_path`, `paused`, and the daily
//! `start_after`/`stop_after` window).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
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
    pub worker_name: String,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
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
pub struct WorkerConfig {
    pub max_prefetch_jobs: usize,
    pub encode_jobs: usize,
    pub threads: u32,
    pub temporal_path: PathBuf,
    pub paused: bool,
    pub start_after: Option<NaiveTime>,
    pub stop_after: Option<NaiveTime>,
    pub download_retry_limit: u32,
    pub upload_retry_limit: u32,
    pub retry_delay: Duration,
    pub ocr_timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    broker: Option<FileBrokerConfig>,
    worker: Option<FileWorkerConfig>,
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
struct FileWorkerConfig {
    name: Option<String>,
    max_prefetch_jobs: Option<usize>,
    encode_jobs: Option<usize>,
    threads: Option<u32>,
    temporal_path: Option<PathBuf>,
    paused: Option<bool>,
    start_after: Option<String>,
    stop_after: Option<String>,
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
    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        match dotenvy::dotenv() {
            Ok(_) | Err(dotenvy::Error::Io(_)) => {}
            Err(err) => return Err(ConfigError::Invalid { field: ".env", message: err.to_string() }),
        }

        let file = self.load_file()?;

        let broker_file = file.broker.unwrap_or_default();
        let broker_url = env_or("TRANSCODIS_BROKER_URL")
            .or(broker_file.url)
            .ok_or(ConfigError::Missing { field: "broker.url", env_var: "TRANSCODIS_BROKER_URL" })?;

        let worker_file = file.worker.unwrap_or_default();
        let worker_name = env_or("TRANSCODIS_WORKER_NAME")
            .or(worker_file.name)
            .ok_or(ConfigError::Missing { field: "worker.name", env_var: "TRANSCODIS_WORKER_NAME" })?;
        let temporal_path = env_path("TRANSCODIS_WORKER_TEMPORAL_PATH")
            .or(worker_file.temporal_path)
            .ok_or(ConfigError::Missing { field: "worker.temporal_path", env_var: "TRANSCODIS_WORKER_TEMPORAL_PATH" })?;

        let max_prefetch_jobs = worker_file.max_prefetch_jobs.unwrap_or(2);
        let encode_jobs = worker_file.encode_jobs.unwrap_or(1);
        let threads = worker_file.threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(2)
        });
        let paused = worker_file.paused.unwrap_or(false);

        let start_after = parse_time_of_day("worker.start_after", worker_file.start_after)?;
        let stop_after = parse_time_of_day("worker.stop_after", worker_file.stop_after)?;

        Ok(Config {
            worker_name,
            broker: BrokerConfig {
                url: broker_url,
                encode_request_queue: broker_file.encode_request_queue.unwrap_or_else(|| "encode.request".to_string()),
                encode_events_queue: broker_file.encode_events_queue.unwrap_or_else(|| "encode.events".to_string()),
                pgs_request_queue: broker_file.pgs_request_queue.unwrap_or_else(|| "pgs.request".to_string()),
                pgs_response_queue: broker_file.pgs_response_queue.unwrap_or_else(|| "pgs.response".to_string()),
            },
            worker: WorkerConfig {
                max_prefetch_jobs,
                encode_jobs,
                threads,
                temporal_path,
                paused,
                start_after,
                stop_after,
                download_retry_limit: 180,
                upload_retry_limit: 17_280,
                retry_delay: Duration::from_secs(5),
                ocr_timeout: Duration::from_secs(90 * 60),
            },
        })
    }

    fn load_file(&self) -> Result<FileConfig, ConfigError> {
        let candidate = self.options.config_path.clone().or_else(default_config_path);
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
    let candidate = Path::new("transcodis-worker.toml");
    candidate.exists().then(|| candidate.to_path_buf())
}

fn env_or(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

fn env_path(var: &str) -> Option<PathBuf> {
    std::env::var(var).ok().map(PathBuf::from)
}

fn parse_time_of_day(field: &'static str, raw: Option<String>) -> Result<Option<NaiveTime>, ConfigError> {
    let Some(raw) = raw else { return Ok(None) };
    NaiveTime::parse_from_str(&raw, "%H:%M")
        .map(Some)
        .map_err(|e| ConfigError::Invalid { field, message: e.to_string() })
}

impl WorkerConfig {
    /// Whether the worker should currently be pulling new work: not
    /// administratively paused, and (if a daily window is configured)
    /// inside it.
    pub fn accepts_new_work_at(&self, now: NaiveTime) -> bool {
        if self.paused {
            return false;
        }
        match (self.start_after, self.stop_after) {
            (Some(start), Some(stop)) if start <= stop => now >= start && now < stop,
            (Some(start), Some(stop)) => now >= start || now < stop, // window wraps midnight
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(start: &str, stop: &str) -> WorkerConfig {
        WorkerConfig {
            max_prefetch_jobs: 2,
            encode_jobs: 1,
            threads: 2,
            temporal_path: PathBuf::from("/tmp"),
            paused: false,
            start_after: Some(NaiveTime::parse_from_str(start, "%H:%M").unwrap()),
            stop_after: Some(NaiveTime::parse_from_str(stop, "%H:%M").unwrap()),
            download_retry_limit: 180,
            upload_retry_limit: 17_280,
            retry_delay: Duration::from_secs(5),
            ocr_timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn daily_window_rejects_outside_hours() {
        let cfg = config("22:00", "06:00");
        assert!(cfg.accepts_new_work_at(NaiveTime::parse_from_str("23:30", "%H:%M").unwrap()));
        assert!(cfg.accepts_new_work_at(NaiveTime::parse_from_str("02:00", "%H:%M").unwrap()));
        assert!(!cfg.accepts_new_work_at(NaiveTime::parse_from_str("12:00", "%H:%M").unwrap()));
    }

    #[test]
    fn paused_worker_never_accepts_work() {
        let mut cfg = config("00:00", "23:59");
        cfg.paused = true;
        assert!(!cfg.accepts_new_work_at(NaiveTime::parse_from_str("12:00", "%H:%M").unwrap()));
    }
}
