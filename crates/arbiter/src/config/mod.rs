use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub use crate::config::language::{
    CompileConfig, DEFAULT_COMPILE_TIMEOUT_MS, DEFAULT_SANDBOX_PATH, FileExtension, Language,
    RunConfig,
};
pub use crate::config::registry::LanguageRegistry;
use crate::runner::ComparisonPolicy;
use crate::sandbox::DEFAULT_READONLY_PATHS;
use crate::types::ResourceLimits;

pub mod language;
mod loader;
mod registry;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../arbiter.example.toml");

/// Prefix for environment variable overrides (e.g. `ARBITER_JUDGE__FAIL_FAST=true`)
pub const ENV_PREFIX: &str = "ARBITER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid characters in file extension")]
    InvalidFileExtChars,

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("language '{0}' not found in configuration")]
    LanguageNotFound(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Config for Arbiter
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory under which per-execution scratch directories are created.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: PathBuf,

    /// Use cgroup v2 hard memory and pid limits instead of sampling.
    ///
    /// Each execution gets its own child cgroup under `cg_root` with
    /// `memory.max`, `memory.swap.max` and `pids.max` set before exec.
    #[serde(default)]
    pub cgroup: bool,

    /// Cgroup root under which per-execution cgroups are created.
    #[serde(default = "default_cg_root")]
    pub cg_root: PathBuf,

    /// Process isolation settings shared by every execution
    #[serde(default)]
    pub sandbox: SandboxSettings,

    /// Orchestration policy
    #[serde(default)]
    pub judge: JudgeSettings,

    /// HTTP service settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Default resource limits applied to all test case runs.
    /// Language and request limits take precedence.
    #[serde(default)]
    pub default_limits: ResourceLimits,

    /// Base limits for compilation steps
    #[serde(default = "default_compile_limits")]
    pub compile_limits: ResourceLimits,

    /// Language configurations keyed by language ID
    #[serde(default)]
    pub languages: HashMap<String, Language>,
}

/// Process isolation knobs
#[derive(Debug, Clone, Deserialize)]
pub struct SandboxSettings {
    /// Run each program in a fresh network namespace
    #[serde(default = "default_true")]
    pub deny_network: bool,

    /// Pivot each program into a private root where only its scratch
    /// directory is writable
    #[serde(default = "default_true")]
    pub confine_filesystem: bool,

    /// Host paths visible read-only inside the private root; a trailing `*`
    /// matches by prefix
    #[serde(default = "default_readonly_paths")]
    pub readonly_paths: Vec<PathBuf>,

    /// Treat a failure to isolate (namespaces unavailable, no way to cap the
    /// process count) as an error instead of running without it
    #[serde(default = "default_true")]
    pub strict_isolation: bool,

    /// Niceness applied to sandboxed processes
    #[serde(default = "default_nice")]
    pub nice: i32,

    /// CPUs sandboxed processes may run on (empty: inherit)
    #[serde(default)]
    pub cpu_affinity: Vec<usize>,

    /// Dedicated unprivileged user to run programs as
    #[serde(default)]
    pub uid: Option<u32>,

    /// Group to run programs as (defaults to `uid` when unset)
    #[serde(default)]
    pub gid: Option<u32>,

    /// RSS sampling interval when no cgroup hard limit is available
    #[serde(default = "default_memory_poll_interval_ms")]
    pub memory_poll_interval_ms: u64,

    /// Budget for feeding stdin before the writer gives up
    #[serde(default = "default_stdin_timeout_ms")]
    pub stdin_timeout_ms: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            deny_network: true,
            confine_filesystem: true,
            readonly_paths: default_readonly_paths(),
            strict_isolation: true,
            nice: default_nice(),
            cpu_affinity: Vec::new(),
            uid: None,
            gid: None,
            memory_poll_interval_ms: default_memory_poll_interval_ms(),
            stdin_timeout_ms: default_stdin_timeout_ms(),
        }
    }
}

/// Orchestration policy for judging requests
#[derive(Debug, Clone, Deserialize)]
pub struct JudgeSettings {
    /// Fixed worker count; derived from available cores when unset
    #[serde(default)]
    pub workers: Option<usize>,

    /// Cores per worker when `workers` is derived
    #[serde(default = "default_safety_factor")]
    pub safety_factor: usize,

    /// Stop evaluating test cases after the first failure
    #[serde(default)]
    pub fail_fast: bool,

    /// How actual output is compared with the expected output
    #[serde(default)]
    pub comparison: ComparisonPolicy,

    /// Bytes of actual output kept in each test case result
    #[serde(default = "default_report_output_bytes")]
    pub report_output_bytes: usize,

    /// Overall budget for one request, compile and all runs included
    #[serde(default)]
    pub request_deadline_ms: Option<u64>,

    /// Maximum test cases accepted per request
    #[serde(default = "default_max_test_cases")]
    pub max_test_cases: usize,

    /// Maximum submitted source size in bytes
    #[serde(default = "default_max_code_bytes")]
    pub max_code_bytes: usize,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            workers: None,
            safety_factor: default_safety_factor(),
            fail_fast: false,
            comparison: ComparisonPolicy::default(),
            report_output_bytes: default_report_output_bytes(),
            request_deadline_ms: None,
            max_test_cases: default_max_test_cases(),
            max_code_bytes: default_max_code_bytes(),
        }
    }
}

/// HTTP service settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Address the service binds to
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Config {
    /// Create a new config with embedded default languages
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty config with no languages
    pub fn empty() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            cgroup: false,
            cg_root: default_cg_root(),
            sandbox: SandboxSettings::default(),
            judge: JudgeSettings::default(),
            server: ServerSettings::default(),
            default_limits: ResourceLimits::default(),
            compile_limits: default_compile_limits(),
            languages: HashMap::new(),
        }
    }

    /// Get a language by ID
    pub fn get_language(&self, id: &str) -> Result<&Language, ConfigError> {
        self.languages
            .get(id)
            .ok_or_else(|| ConfigError::LanguageNotFound(id.to_string()))
    }

    /// Build the read-only language registry
    pub fn registry(&self) -> LanguageRegistry {
        LanguageRegistry::new(self.languages.clone())
    }

    /// Merge resource limits with defaults
    pub fn effective_limits(&self, overrides: Option<&ResourceLimits>) -> ResourceLimits {
        match overrides {
            Some(limits) => self.default_limits.with_overrides(limits),
            None => self.default_limits.clone(),
        }
    }

    /// Worker count: explicit setting, else cores divided by the safety factor
    pub fn worker_count(&self) -> usize {
        if let Some(workers) = self.judge.workers {
            return workers.max(1);
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cores / self.judge.safety_factor.max(1)).max(1)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_toml(EXAMPLE_CONFIG).expect("embedded default config should be valid")
    }
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("arbiter")
}

fn default_cg_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup/arbiter")
}

/// Default compilation limits
fn default_compile_limits() -> ResourceLimits {
    ResourceLimits {
        time_limit_ms: None,
        memory_limit_mb: Some(1024),
        max_processes: Some(64),
        max_output_bytes: Some(ResourceLimits::MB),
        max_file_size_kb: Some(256 * 1024),
        max_open_files: Some(256),
        stack_limit_mb: None,
    }
}

fn default_true() -> bool {
    true
}

fn default_readonly_paths() -> Vec<PathBuf> {
    DEFAULT_READONLY_PATHS.iter().map(PathBuf::from).collect()
}

fn default_nice() -> i32 {
    10
}

fn default_memory_poll_interval_ms() -> u64 {
    25
}

fn default_stdin_timeout_ms() -> u64 {
    1000
}

fn default_safety_factor() -> usize {
    2
}

fn default_report_output_bytes() -> usize {
    64 * 1024
}

fn default_max_test_cases() -> usize {
    256
}

fn default_max_code_bytes() -> usize {
    256 * 1024
}

fn default_bind() -> String {
    "127.0.0.1:8001".to_string()
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}
