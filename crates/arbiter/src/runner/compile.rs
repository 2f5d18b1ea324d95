//! Compilation step for code execution
//!
//! Handles compiling source code using language-specific compilers.

use tracing::{debug, instrument};

use crate::config::{Config, Language};
use crate::runner::{CompileError, Runner};
use crate::sandbox::{SandboxCommand, ScratchDir, run_with_output};
use crate::types::{ExecutionResult, LimitExceeded, ResourceLimits};

/// Result of a compilation
#[derive(Debug, Clone)]
pub struct CompileResult {
    /// Whether compilation succeeded
    pub success: bool,

    /// Execution result from the compilation process
    pub execution: ExecutionResult,

    /// Combined compiler output
    pub output: String,
}

impl CompileResult {
    /// Check if compilation was successful
    pub fn is_success(&self) -> bool {
        self.success && self.execution.exit_code == Some(0)
    }

    /// Whether the compiler ran out of its wall clock budget
    pub fn timed_out(&self) -> bool {
        self.execution.limit_exceeded == LimitExceeded::WallTime
    }

    /// Turn a failed compilation into the error reported to the submitter
    pub fn into_error(self) -> CompileError {
        if self.timed_out() {
            return CompileError::Timeout;
        }
        CompileError::Failed {
            exit_code: self.execution.exit_code.unwrap_or(-1),
            output: self.output,
        }
    }
}

/// Limits for the compiler: compile defaults, then the language's compile
/// limits, with the wall clock taken from the compile timeout
pub(crate) fn compile_limits(config: &Config, language: &Language) -> Option<ResourceLimits> {
    let compile_config = language.compile.as_ref()?;
    let mut limits = config.compile_limits.clone();
    if let Some(ref lang_limits) = compile_config.limits {
        limits = limits.with_overrides(lang_limits);
    }
    Some(limits.with_time_limit_ms(compile_config.timeout_ms))
}

/// Compile the source already written to `scratch`
#[instrument(skip(runner, scratch), fields(scratch = %scratch.id(), language = %language.name))]
pub async fn compile(
    runner: &Runner,
    scratch: &ScratchDir,
    language: &Language,
) -> Result<CompileResult, CompileError> {
    let compile_config = language
        .compile
        .as_ref()
        .ok_or_else(|| CompileError::NotCompiled(language.name.clone()))?;
    let limits = compile_limits(runner.config(), language)
        .ok_or_else(|| CompileError::NotCompiled(language.name.clone()))?;

    let expanded_cmd = Language::expand_command(
        &compile_config.command,
        &compile_config.source_name,
        &compile_config.output_name,
    );

    // compilers and their runtimes reserve far more address space than they use
    let command = SandboxCommand::new(expanded_cmd)
        .limits(limits)
        .address_space_limit(false)
        .search_path(&language.run.path)
        .envs(&compile_config.env)
        .isolation(runner.isolation().clone());

    let (result, mut output) = run_with_output(scratch, command, runner.supervision()).await?;

    let mut success = result.is_success();
    if success && !scratch.file_exists(&compile_config.output_name).await? {
        success = false;
        output = format!(
            "compiler exited successfully but produced no '{}'",
            compile_config.output_name
        );
    }

    debug!(
        success,
        exit_code = ?result.exit_code,
        status = ?result.status,
        wall_time_ms = result.wall_time_ms,
        "compilation complete"
    );

    if output.is_empty()
        && let Some(ref msg) = result.message
    {
        output = msg.clone();
    }

    Ok(CompileResult {
        success,
        execution: result,
        output,
    })
}
