use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DreamError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Upper bound on pool size; anything above is almost certainly a typo.
const MAX_WORKER_THREADS: usize = 256;

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `DREAM_PROFILE`. When set (e.g. `EDITOR`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("DREAM_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            tasks: TaskConfig::from_env_profiled(p),
            log: LogConfig::from_env_profiled(p),
        }
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, DreamError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DreamError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn validate(&self) -> Result<(), DreamError> {
        self.tasks.validate()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  tasks:  workers={} (resolved {}), prefix={}, deferral_warn={}, idle_sleep={}us",
            self.tasks.worker_threads,
            self.tasks.resolved_worker_threads(),
            self.tasks.thread_name_prefix,
            self.tasks.deferral_warn_threshold,
            self.tasks.idle_sleep_micros
        );
        tracing::info!("  log:    filter={}", self.log.filter);
    }

    /// JSON view of the resolved config, for tooling.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "tasks": {
                "worker_threads": self.tasks.worker_threads,
                "resolved_worker_threads": self.tasks.resolved_worker_threads(),
                "thread_name_prefix": self.tasks.thread_name_prefix,
                "stack_size_kib": self.tasks.stack_size_kib,
                "deferral_warn_threshold": self.tasks.deferral_warn_threshold,
                "idle_sleep_micros": self.tasks.idle_sleep_micros,
            },
            "log": { "filter": self.log.filter },
        })
    }
}

// ── Tasks ─────────────────────────────────────────────────────

/// Worker pool settings for the task manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Number of worker threads. 0 = available parallelism.
    #[serde(default)]
    pub worker_threads: usize,
    /// Worker threads are named `{prefix}-{id}`.
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
    /// Stack size per worker in KiB. `None` uses the platform default.
    #[serde(default)]
    pub stack_size_kib: Option<usize>,
    /// Deferral count at which a blocked task is reported once.
    #[serde(default = "default_deferral_warn_threshold")]
    pub deferral_warn_threshold: u32,
    /// Sleep applied by an idle worker once its backoff is exhausted. 0 = yield only.
    #[serde(default = "default_idle_sleep_micros")]
    pub idle_sleep_micros: u64,
}

fn default_thread_name_prefix() -> String { "dream-task".into() }
fn default_deferral_warn_threshold() -> u32 { 10_000 }
fn default_idle_sleep_micros() -> u64 { 50 }

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_name_prefix: default_thread_name_prefix(),
            stack_size_kib: None,
            deferral_warn_threshold: default_deferral_warn_threshold(),
            idle_sleep_micros: default_idle_sleep_micros(),
        }
    }
}

impl TaskConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            worker_threads: profiled_env_parse(p, "TASK_WORKER_THREADS", 0),
            thread_name_prefix: profiled_env_or(p, "TASK_THREAD_PREFIX", "dream-task"),
            stack_size_kib: profiled_env_opt(p, "TASK_STACK_KIB").and_then(|v| v.parse().ok()),
            deferral_warn_threshold: profiled_env_parse(
                p,
                "TASK_DEFERRAL_WARN",
                default_deferral_warn_threshold(),
            ),
            idle_sleep_micros: profiled_env_parse(
                p,
                "TASK_IDLE_SLEEP_US",
                default_idle_sleep_micros(),
            ),
        }
    }

    /// Fixed pool size with the given number of workers and default settings.
    pub fn with_workers(worker_threads: usize) -> Self {
        Self {
            worker_threads,
            ..Self::default()
        }
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            self.worker_threads
        }
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_micros(self.idle_sleep_micros)
    }

    /// Worker stack size in bytes. `None` also for a size `validate` rejects.
    pub fn stack_size(&self) -> Option<usize> {
        self.stack_size_kib.and_then(|kib| kib.checked_mul(1024))
    }

    pub fn validate(&self) -> Result<(), DreamError> {
        if self.worker_threads > MAX_WORKER_THREADS {
            return Err(DreamError::Config(format!(
                "tasks.worker_threads = {} exceeds the limit of {}",
                self.worker_threads, MAX_WORKER_THREADS
            )));
        }
        if self.thread_name_prefix.trim().is_empty() {
            return Err(DreamError::Config(
                "tasks.thread_name_prefix must not be empty".into(),
            ));
        }
        if self.deferral_warn_threshold == 0 {
            return Err(DreamError::Config(
                "tasks.deferral_warn_threshold must be > 0".into(),
            ));
        }
        if let Some(kib) = self.stack_size_kib {
            if kib == 0 {
                return Err(DreamError::Config("tasks.stack_size_kib must be > 0".into()));
            }
            if kib.checked_mul(1024).is_none() {
                return Err(DreamError::Config(format!(
                    "tasks.stack_size_kib = {kib} overflows a byte count"
                )));
            }
        }
        Ok(())
    }
}

// ── Logging ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String { "info".into() }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

impl LogConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            filter: profiled_env_or(p, "DREAM_LOG", "info"),
        }
    }
}
