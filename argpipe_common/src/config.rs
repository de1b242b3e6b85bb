//! Service configuration.
//!
//! Everything is read from the environment with sensible defaults, so the
//! daemon can be configured from a systemd unit or a container environment
//! without a config file. All variables are prefixed `ARGPIPE_`.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::{Error, Result};

/// Runtime configuration for the daemon.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub api_host: String,
    /// Port the HTTP server binds to.
    pub api_port: u16,
    /// Path of the SQLite job store.
    pub database_url: String,
    /// Directory that receives one `<sample>_<run>` tree per submission.
    pub outputs_root: PathBuf,
    /// The analysis pipeline script we supervise.
    pub script_path: PathBuf,
    /// Root directory of the reference data bundles.
    pub databases_root: PathBuf,
    /// Maximum number of concurrently running jobs.
    pub max_concurrent_jobs: usize,
    /// Maximum number of concurrently downloading assets.
    pub max_concurrent_downloads: usize,
    /// Seconds between SIGTERM and SIGKILL when stopping a job.
    pub stop_grace_period_seconds: u64,
    /// Seconds to wait for running jobs when the daemon shuts down.
    pub shutdown_drain_seconds: u64,
    /// Thread count passed to the pipeline when the caller omits one.
    pub default_threads: i32,
    /// Optional wall-clock limit per job. `None` means unlimited.
    pub job_timeout_seconds: Option<u64>,
}

impl Config {
    /// Build a configuration from the environment.
    pub fn from_env() -> Result<Config> {
        Ok(Config {
            api_host: var_or("ARGPIPE_API_HOST", "127.0.0.1"),
            api_port: parsed_var("ARGPIPE_API_PORT")?.unwrap_or(8000),
            database_url: var_or("ARGPIPE_DATABASE_URL", "argpipe.db"),
            outputs_root: PathBuf::from(var_or("ARGPIPE_OUTPUTS_ROOT", "outputs")),
            script_path: PathBuf::from(var_or(
                "ARGPIPE_SCRIPT_PATH",
                "pipeline/arg_pipeline.sh",
            )),
            databases_root: PathBuf::from(var_or(
                "ARGPIPE_DATABASES_ROOT",
                "databases",
            )),
            max_concurrent_jobs: parsed_var("ARGPIPE_MAX_CONCURRENT_JOBS")?
                .unwrap_or(1),
            max_concurrent_downloads: parsed_var("ARGPIPE_MAX_CONCURRENT_DOWNLOADS")?
                .unwrap_or(2),
            stop_grace_period_seconds: parsed_var("ARGPIPE_STOP_GRACE_PERIOD_SECONDS")?
                .unwrap_or(10),
            shutdown_drain_seconds: parsed_var("ARGPIPE_SHUTDOWN_DRAIN_SECONDS")?
                .unwrap_or(30),
            default_threads: parsed_var("ARGPIPE_DEFAULT_THREADS")?.unwrap_or(8),
            job_timeout_seconds: parsed_var("ARGPIPE_JOB_TIMEOUT_SECONDS")?,
        })
    }

    /// The directory the pipeline script runs in.
    ///
    /// The script resolves its own relative paths (`outputs/`, `data/`)
    /// against its location, so we always spawn it from there.
    pub fn script_dir(&self) -> PathBuf {
        self.script_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Read an environment variable, falling back to a default.
fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Read and parse an environment variable, if set.
fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => {
            let parsed = value
                .parse()
                .with_context(|| format!("could not parse {} = {:?}", name, value))
                .map_err(Error::Other)?;
            Ok(Some(parsed))
        }
        Err(_) => Ok(None),
    }
}
