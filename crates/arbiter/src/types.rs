use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall clock time limit in milliseconds
    #[serde(default)]
    pub time_limit_ms: Option<u64>,

    /// Memory limit in megabytes
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,

    /// Maximum number of processes/threads
    #[serde(default)]
    pub max_processes: Option<u32>,

    /// Maximum bytes captured from each of stdout and stderr
    #[serde(default)]
    pub max_output_bytes: Option<u64>,

    /// Maximum size of any file written by the program, in kilobytes
    #[serde(default)]
    pub max_file_size_kb: Option<u64>,

    /// Maximum open files
    #[serde(default)]
    pub max_open_files: Option<u32>,

    /// Stack size limit in megabytes
    #[serde(default)]
    pub stack_limit_mb: Option<u64>,
}

impl ResourceLimits {
    /// 1 kilobyte in bytes
    pub const KB: u64 = 1024;
    /// 1 megabyte in bytes
    pub const MB: u64 = 1024 * 1024;

    /// Create new resource limits populated with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits with every field unset, used as an override layer
    pub fn unset() -> Self {
        Self {
            time_limit_ms: None,
            memory_limit_mb: None,
            max_processes: None,
            max_output_bytes: None,
            max_file_size_kb: None,
            max_open_files: None,
            stack_limit_mb: None,
        }
    }

    /// Set the wall clock time limit in milliseconds
    pub fn with_time_limit_ms(mut self, ms: u64) -> Self {
        self.time_limit_ms = Some(ms);
        self
    }

    /// Set the memory limit in megabytes
    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    /// Set the maximum number of processes
    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = Some(count);
        self
    }

    /// Set the maximum captured output per stream in bytes
    pub fn with_max_output_bytes(mut self, bytes: u64) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Set the stack size limit in megabytes
    pub fn with_stack_limit_mb(mut self, mb: u64) -> Self {
        self.stack_limit_mb = Some(mb);
        self
    }

    /// Apply overrides from another ResourceLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            time_limit_ms: overrides.time_limit_ms.or(self.time_limit_ms),
            memory_limit_mb: overrides.memory_limit_mb.or(self.memory_limit_mb),
            max_processes: overrides.max_processes.or(self.max_processes),
            max_output_bytes: overrides.max_output_bytes.or(self.max_output_bytes),
            max_file_size_kb: overrides.max_file_size_kb.or(self.max_file_size_kb),
            max_open_files: overrides.max_open_files.or(self.max_open_files),
            stack_limit_mb: overrides.stack_limit_mb.or(self.stack_limit_mb),
        }
    }

    /// Memory limit in kilobytes, the unit memory is measured in
    pub fn memory_limit_kb(&self) -> Option<u64> {
        self.memory_limit_mb.map(|mb| mb.saturating_mul(1024))
    }

    /// Output capture cap in bytes, falling back to the default cap
    pub fn output_cap(&self) -> usize {
        let bytes = self.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES);
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }
}

/// Default per-stream capture cap (8 MiB)
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 8 * ResourceLimits::MB;

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_limit_ms: Some(2000),
            memory_limit_mb: Some(256),
            max_processes: Some(16),
            max_output_bytes: Some(DEFAULT_MAX_OUTPUT_BYTES),
            max_file_size_kb: Some(16 * 1024),
            max_open_files: Some(64),
            stack_limit_mb: Some(64),
        }
    }
}

/// Result of a single sandboxed execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Execution status
    pub status: ExecutionStatus,

    /// Secondary status indicating which limit was exceeded (if any)
    pub limit_exceeded: LimitExceeded,

    /// Wall clock time from spawn to exit, in milliseconds
    pub wall_time_ms: u64,

    /// Peak memory usage in kilobytes
    pub memory_kb: u64,

    /// Exit code if the program exited normally
    pub exit_code: Option<i32>,

    /// Signal number if the program was killed by a signal
    pub signal: Option<i32>,

    /// Additional message from the sandbox
    pub message: Option<String>,

    /// Captured standard output
    pub stdout: Vec<u8>,

    /// Captured standard error
    pub stderr: Vec<u8>,

    /// Whether stdout hit the capture cap
    pub stdout_truncated: bool,

    /// Whether stderr hit the capture cap
    pub stderr_truncated: bool,
}

impl ExecutionResult {
    /// Check if the execution was successful (exited with code 0)
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExecutionStatus::Ok) && self.exit_code == Some(0)
    }

    /// Peak memory rounded up to whole megabytes
    pub fn memory_mb(&self) -> u64 {
        self.memory_kb.div_ceil(1024)
    }

    /// Reclassify a failed run as a memory limit violation.
    ///
    /// Under an address-space cap an allocation fails inside the program
    /// instead of the limiter killing it, so a crash whose peak came within
    /// 90% of the limit, or whose stderr reports an allocation failure, is
    /// attributed to memory.
    pub fn detect_memory_limit(&mut self, memory_limit_kb: u64) {
        if self.is_success() || self.limit_exceeded.is_exceeded() {
            return;
        }

        let near_limit = self.memory_kb.saturating_mul(10) >= memory_limit_kb.saturating_mul(9);
        let stderr = String::from_utf8_lossy(&self.stderr);
        let reported = OOM_MARKERS.iter().any(|marker| stderr.contains(marker));

        if near_limit || reported {
            self.limit_exceeded = LimitExceeded::Memory;
            self.message = Some("memory limit exceeded".to_string());
        }
    }
}

/// Diagnostics runtimes print when an allocation fails
const OOM_MARKERS: [&str; 6] = [
    "MemoryError",
    "std::bad_alloc",
    "memory allocation of",
    "OutOfMemoryError",
    "out of memory",
    "JavaScript heap out of memory",
];

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            status: ExecutionStatus::Ok,
            limit_exceeded: LimitExceeded::NotExceeded,
            wall_time_ms: 0,
            memory_kb: 0,
            exit_code: None,
            signal: None,
            message: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }
}

/// Status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Program exited normally
    #[serde(rename = "OK")]
    Ok,

    /// Runtime error (non-zero exit code)
    #[serde(rename = "RE")]
    RuntimeError,

    /// Time limit exceeded
    #[serde(rename = "TO")]
    TimeLimitExceeded,

    /// Program was killed by a signal
    #[serde(rename = "SG")]
    Signaled,

    /// Internal error in the sandbox
    #[serde(rename = "XX")]
    InternalError,
}

impl ExecutionStatus {
    /// Derive the status from how the process ended
    pub fn from_exit(exit_code: Option<i32>, signal: Option<i32>, timed_out: bool) -> Self {
        if timed_out {
            return ExecutionStatus::TimeLimitExceeded;
        }
        match (exit_code, signal) {
            (Some(0), _) => ExecutionStatus::Ok,
            (Some(_), _) => ExecutionStatus::RuntimeError,
            (None, Some(_)) => ExecutionStatus::Signaled,
            (None, None) => ExecutionStatus::InternalError,
        }
    }
}

/// Secondary status indicating which resource limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LimitExceeded {
    /// No limit was exceeded
    #[default]
    #[serde(rename = "none")]
    NotExceeded,

    /// Wall clock time limit exceeded
    #[serde(rename = "wall_time")]
    WallTime,

    /// Memory limit exceeded (MLE)
    #[serde(rename = "memory")]
    Memory,

    /// Output capture cap reached
    #[serde(rename = "output")]
    Output,
}

impl LimitExceeded {
    /// Check if any limit was exceeded
    #[must_use]
    pub fn is_exceeded(&self) -> bool {
        !matches!(self, LimitExceeded::NotExceeded)
    }

    /// Whether the limiter killed the process for this limit.
    ///
    /// Hitting the output cap only truncates the capture.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, LimitExceeded::WallTime | LimitExceeded::Memory)
    }
}
