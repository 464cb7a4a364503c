//! Configuration parsing and validation for the supervisor
//!
//! This module handles command-line argument parsing and validation using clap.
//! Every flag can also be set through a `HOTSWAP_*` environment variable.
use anyhow::anyhow;
use clap::{Parser, ValueEnum};
use hotswap::ControlPaths;
use std::path::PathBuf;
use std::time::Duration;

/// How artifacts are run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Execute the artifact as a child process listening on `--worker-port`.
    Process,
    /// Load the artifact as a shared library exporting the entry point.
    Library,
}

#[derive(Debug, Clone, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// The port on which the public listener accepts traffic.
    #[arg(short = 'p', long, env = "HOTSWAP_PORT", default_value_t = 8080)]
    pub port: u16,

    /// The port process workers are told to listen on (passed as `PORT`).
    #[arg(long, env = "HOTSWAP_WORKER_PORT", default_value_t = 6060)]
    pub worker_port: u16,

    #[arg(short = 'b', long, env = "HOTSWAP_BACKEND", value_enum, default_value_t = BackendKind::Process)]
    pub backend: BackendKind,

    /// Artifact to start with when nothing is staged.
    #[arg(short = 'a', long, env = "HOTSWAP_ARTIFACT")]
    pub artifact: Option<PathBuf>,

    /// Directory holding the staging slot and adopted artifacts.
    #[arg(long, env = "HOTSWAP_STAGING_DIR", default_value = "/tmp/hotswap")]
    pub staging_dir: PathBuf,

    /// Directory the fetch endpoint stages artifacts from. Fetch is disabled without it.
    #[arg(long, env = "HOTSWAP_SOURCE_DIR")]
    pub source_dir: Option<PathBuf>,

    #[arg(long, env = "HOTSWAP_RELOAD_PATH", default_value = "/_reload")]
    pub reload_path: String,

    #[arg(long, env = "HOTSWAP_UPLOAD_PATH", default_value = "/_upload")]
    pub upload_path: String,

    #[arg(long, env = "HOTSWAP_SHUTDOWN_PATH", default_value = "/_shutdown")]
    pub shutdown_path: String,

    #[arg(long, env = "HOTSWAP_FETCH_PATH", default_value = "/_fetch")]
    pub fetch_path: String,

    #[arg(long, env = "HOTSWAP_STATUS_PATH", default_value = "/_status")]
    pub status_path: String,

    /// Upper bound on draining in-flight requests at shutdown.
    #[arg(long, env = "HOTSWAP_GRACE_PERIOD_SECS", default_value_t = 5)]
    pub grace_period_secs: u64,

    /// How long a new process worker has to start accepting connections.
    #[arg(long, env = "HOTSWAP_READY_TIMEOUT_MS", default_value_t = 10_000)]
    pub ready_timeout_ms: u64,

    /// Delay between attempts when a worker repeatedly fails to spawn.
    #[arg(long, env = "HOTSWAP_SPAWN_RETRY_DELAY_MS", default_value_t = 1_000)]
    pub spawn_retry_delay_ms: u64,

    /// Capacity of the control channel.
    #[arg(long, env = "HOTSWAP_CHANNEL_CAPACITY", default_value_t = 32)]
    pub channel_capacity: usize,

    /// The port on which the metrics server will listen.
    #[arg(long, env = "HOTSWAP_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Whether to enable the metrics endpoint.
    #[arg(short = 'm', long, env = "HOTSWAP_METRICS", default_value_t = false)]
    pub metrics: bool,

    /// The prefix to use for metrics.
    #[arg(long, env = "HOTSWAP_METRICS_PREFIX", default_value = "hotswap")]
    pub metrics_prefix: String,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Config {
    pub fn validate(self) -> Result<Self, anyhow::Error> {
        if let Some(artifact) = &self.artifact
            && !artifact.is_file()
        {
            return Err(anyhow!(
                "Artifact '{}' does not exist or is not a file",
                artifact.display()
            ));
        }
        if let Some(source_dir) = &self.source_dir
            && !source_dir.is_dir()
        {
            return Err(anyhow!(
                "Source directory '{}' does not exist",
                source_dir.display()
            ));
        }
        if self.backend == BackendKind::Process && self.worker_port == self.port {
            return Err(anyhow!(
                "Worker port {} collides with the public port",
                self.worker_port
            ));
        }
        if self.metrics && self.metrics_port == self.port {
            return Err(anyhow!(
                "Metrics port {} collides with the public port",
                self.metrics_port
            ));
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("Channel capacity must be at least 1"));
        }

        let paths = self.control_paths();
        let all = [
            &paths.reload,
            &paths.upload,
            &paths.shutdown,
            &paths.fetch,
            &paths.status,
        ];
        for (i, path) in all.iter().enumerate() {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(anyhow!("Control path '{path}' must start with '/' and not be the root"));
            }
            if all[..i].contains(path) {
                return Err(anyhow!("Control path '{path}' is used twice"));
            }
        }
        Ok(self)
    }

    pub fn control_paths(&self) -> ControlPaths {
        ControlPaths {
            reload: self.reload_path.clone(),
            upload: self.upload_path.clone(),
            shutdown: self.shutdown_path.clone(),
            fetch: self.fetch_path.clone(),
            status: self.status_path.clone(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn spawn_retry_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_retry_delay_ms)
    }
}
