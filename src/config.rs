//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// How worker subprocesses are spawned and how long each exchange may take.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Executable speaking the worker protocol on stdin/stdout.
    pub program: PathBuf,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment for the subprocess.
    pub env: Vec<(String, String)>,
    /// Deadline for writing one message to the subprocess.
    pub send_timeout: Duration,
    /// Deadline for the `build` action.
    pub build_timeout: Duration,
    /// Deadline for the `write_results` action.
    pub write_results_timeout: Duration,
    /// Deadline for each termination escalation step.
    pub term_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("exp_worker"),
            args: Vec::new(),
            env: Vec::new(),
            send_timeout: Duration::from_secs(10),
            build_timeout: Duration::from_secs(15),
            write_results_timeout: Duration::from_secs(15),
            term_timeout: Duration::from_secs(2),
        }
    }
}

impl WorkerConfig {
    /// Worker config running the given program with default timeouts.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Set the termination escalation step timeout.
    pub fn with_term_timeout(mut self, timeout: Duration) -> Self {
        self.term_timeout = timeout;
        self
    }

    /// Add an environment variable for the subprocess.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker: WorkerConfig,
    /// Root of the results tree, scanned for the last RID when the cache is missing.
    pub results_dir: PathBuf,
    /// File caching the last issued RID.
    pub rid_cache: PathBuf,
    /// Optional JSON-lines log of every submission.
    pub submission_log: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            results_dir: PathBuf::from("results"),
            rid_cache: PathBuf::from("last_rid.json"),
            submission_log: None,
        }
    }
}

/// Master service configuration.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub scheduler: SchedulerConfig,
    /// Address the control surface listens on.
    pub bind_addr: SocketAddr,
    /// Experiment repository root.
    pub repository_dir: PathBuf,
    /// Directory for rolling log files (stderr only if unset).
    pub log_dir: Option<PathBuf>,
}

impl MasterConfig {
    /// Build from `EXP_MASTER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = WorkerConfig::default();

        let program = std::env::var("EXP_MASTER_WORKER_PROGRAM")
            .map(PathBuf::from)
            .unwrap_or_else(|_| sibling_worker_binary().unwrap_or(defaults.program.clone()));

        let args: Vec<String> = std::env::var("EXP_MASTER_WORKER_ARGS")
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let term_timeout = env_millis("EXP_MASTER_TERM_TIMEOUT_MS").unwrap_or(defaults.term_timeout);
        let send_timeout = env_millis("EXP_MASTER_SEND_TIMEOUT_MS").unwrap_or(defaults.send_timeout);

        let results_dir = std::env::var("EXP_MASTER_RESULTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("results"));

        // Workers change into the revision's working directory.
        let worker_results_dir = std::path::absolute(&results_dir)?;
        let worker = WorkerConfig {
            program,
            args,
            env: vec![(
                "EXP_RESULTS_DIR".to_string(),
                worker_results_dir.display().to_string(),
            )],
            send_timeout,
            term_timeout,
            ..defaults
        };

        let scheduler = SchedulerConfig {
            worker,
            results_dir,
            rid_cache: std::env::var("EXP_MASTER_RID_CACHE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("last_rid.json")),
            submission_log: std::env::var("EXP_MASTER_SUBMISSION_LOG")
                .ok()
                .map(PathBuf::from),
        };

        let bind = std::env::var("EXP_MASTER_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3250".to_string());
        let bind_addr = bind.parse().map_err(|e: std::net::AddrParseError| {
            ConfigError::InvalidValue {
                key: "EXP_MASTER_BIND_ADDR".to_string(),
                message: format!("{bind}: {e}"),
            }
        })?;

        Ok(Self {
            scheduler,
            bind_addr,
            repository_dir: std::env::var("EXP_MASTER_REPOSITORY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("repository")),
            log_dir: std::env::var("EXP_MASTER_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
}

/// `exp_worker` installed next to the running executable, if any.
fn sibling_worker_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.with_file_name(format!("exp_worker{}", std::env::consts::EXE_SUFFIX));
    candidate.exists().then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.send_timeout, Duration::from_secs(10));
        assert_eq!(config.build_timeout, Duration::from_secs(15));
        assert_eq!(config.write_results_timeout, Duration::from_secs(15));
        assert_eq!(config.term_timeout, Duration::from_secs(2));
    }

    #[test]
    fn worker_builders() {
        let config = WorkerConfig::with_program("/bin/true")
            .with_term_timeout(Duration::from_millis(300))
            .with_env("A", "1");
        assert_eq!(config.program, PathBuf::from("/bin/true"));
        assert_eq!(config.term_timeout, Duration::from_millis(300));
        assert_eq!(config.env, vec![("A".to_string(), "1".to_string())]);
    }
}
