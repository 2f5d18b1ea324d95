//! Code runner for Arbiter
//!
//! Provides high-level APIs for compiling and executing code in sandboxed
//! scratch directories.

use std::sync::Arc;

use thiserror::Error;

pub use crate::runner::compare::ComparisonPolicy;
pub use crate::runner::compile::{CompileResult, compile};
pub use crate::runner::execute::{TestPlan, execute, judge_output, run_test_case};
pub use crate::runner::retry::{INFRASTRUCTURE_ATTEMPTS, retry_infrastructure};

mod compare;
mod compile;
mod execute;
mod retry;

use crate::{
    config::{Config, Language},
    judge::{TestCase, TestCaseResult},
    sandbox::{IsolationOptions, SandboxError, ScratchDir, Supervision, WorkerPool},
    types::{ExecutionResult, ResourceLimits},
};

/// Errors that occur during compilation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed with exit code {exit_code}: {output}")]
    Failed { exit_code: i32, output: String },

    #[error("compilation timed out")]
    Timeout,

    #[error("language '{0}' does not support compilation")]
    NotCompiled(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

impl CompileError {
    /// Message shown to the submitter.
    ///
    /// For a failed build this is the compiler's own output.
    pub fn user_message(&self) -> String {
        match self {
            CompileError::Failed { output, exit_code } if output.trim().is_empty() => {
                format!("compilation failed with exit code {exit_code}")
            }
            CompileError::Failed { output, .. } => output.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the failure is the host's rather than the submission's
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, CompileError::Sandbox(e) if e.is_infrastructure())
    }
}

/// Errors that occur during execution
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("execution not started: {0}")]
    NotStarted(String),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

impl ExecuteError {
    /// Whether the failure is the host's and worth one more attempt
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ExecuteError::Sandbox(e) if e.is_infrastructure())
    }
}

/// High-level runner for code execution
///
/// Cloning is cheap; the configuration is shared.
#[derive(Debug, Clone)]
pub struct Runner {
    config: Arc<Config>,
    supervision: Supervision,
    isolation: IsolationOptions,
}

impl Runner {
    /// Create a new runner with the given configuration
    pub fn new(config: Config, supervision: Supervision) -> Self {
        let isolation = IsolationOptions::from_settings(&config.sandbox);
        Self {
            config: Arc::new(config),
            supervision,
            isolation,
        }
    }

    /// Create a new runner with default configuration and no cgroups
    pub fn with_defaults() -> Self {
        let config = Config::default();
        let supervision = Supervision::from_config(&config, false);
        Self::new(config, supervision)
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the supervision settings
    pub fn supervision(&self) -> &Supervision {
        &self.supervision
    }

    /// Get the process isolation applied to every run
    pub fn isolation(&self) -> &IsolationOptions {
        &self.isolation
    }

    /// Write the submission into `scratch` under the language's source name
    pub async fn write_source(
        &self,
        scratch: &ScratchDir,
        source: &[u8],
        language: &Language,
    ) -> Result<(), SandboxError> {
        scratch.write_file(&language.source_name(), source).await
    }

    /// Compile the source in `scratch`
    pub async fn compile(
        &self,
        scratch: &ScratchDir,
        language: &Language,
    ) -> Result<CompileResult, CompileError> {
        compile::compile(self, scratch, language).await
    }

    /// Run a program with batch I/O
    pub async fn run(
        &self,
        scratch: &ScratchDir,
        input: Option<&[u8]>,
        language: &Language,
        limits: Option<&ResourceLimits>,
    ) -> Result<ExecutionResult, ExecuteError> {
        execute::execute(self, scratch, language, input, limits).await
    }

    /// Run one test case against the artifacts in `build`
    pub async fn run_test_case(
        &self,
        pool: &WorkerPool,
        build: &ScratchDir,
        plan: &TestPlan,
        index: usize,
        case: &TestCase,
    ) -> Result<TestCaseResult, ExecuteError> {
        execute::run_test_case(self, pool, build, plan, index, case).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_creation() {
        let runner = Runner::with_defaults();
        // default config includes the embedded languages
        assert!(runner.config().languages.contains_key("cpp17"));
        assert!(runner.config().languages.contains_key("python3"));
        assert!(runner.supervision().cgroup_root.is_none());
        assert!(runner.isolation().deny_network);
    }

    #[test]
    fn compile_error_messages() {
        let failed = CompileError::Failed {
            exit_code: 1,
            output: "main.c:3: error: expected ';'".to_string(),
        };
        assert_eq!(failed.user_message(), "main.c:3: error: expected ';'");

        let silent = CompileError::Failed {
            exit_code: 2,
            output: String::new(),
        };
        assert_eq!(silent.user_message(), "compilation failed with exit code 2");

        assert_eq!(CompileError::Timeout.user_message(), "compilation timed out");
    }

    #[test]
    fn infrastructure_classification() {
        let spawn = SandboxError::SpawnFailed(std::io::Error::other("EAGAIN"));
        assert!(ExecuteError::from(spawn).is_infrastructure());
        assert!(!ExecuteError::NotStarted("main".into()).is_infrastructure());
        assert!(!CompileError::Timeout.is_infrastructure());
    }
}
