//! Execution step for code running
//!
//! Handles running programs with input/output and turning one test case run
//! into a [`TestCaseResult`].

use tracing::{debug, instrument, warn};

use crate::config::Language;
use crate::judge::{ErrorKind, TestCase, TestCaseResult};
use crate::runner::{ComparisonPolicy, ExecuteError, Runner, retry_infrastructure};
use crate::sandbox::{SandboxCommand, ScratchDir, WorkerPool, run_batch};
use crate::types::{ExecutionResult, ExecutionStatus, LimitExceeded, ResourceLimits};

/// Bytes of stderr quoted in a runtime error message
const STDERR_EXCERPT_BYTES: usize = 2048;

/// Everything shared by the test case runs of one request
#[derive(Debug, Clone)]
pub struct TestPlan {
    pub language: Language,
    /// Request limits, layered over the language and default limits
    pub limits: ResourceLimits,
    pub comparison: ComparisonPolicy,
    pub report_output_bytes: usize,
}

/// Execute a program in a scratch directory with batch I/O
#[instrument(skip(runner, scratch, input, limits), fields(scratch = %scratch.id(), language = %language.name))]
pub async fn execute(
    runner: &Runner,
    scratch: &ScratchDir,
    language: &Language,
    input: Option<&[u8]>,
    limits: Option<&ResourceLimits>,
) -> Result<ExecutionResult, ExecuteError> {
    // config defaults → language run limits → request overrides
    let mut effective_limits = runner.config().default_limits.clone();
    if let Some(ref lang_limits) = language.run.limits {
        effective_limits = effective_limits.with_overrides(lang_limits);
    }
    if let Some(user_limits) = limits {
        effective_limits = effective_limits.with_overrides(user_limits);
    }

    let entry = language.binary_name();
    if !scratch.file_exists(&entry).await? {
        return Err(ExecuteError::NotStarted(format!(
            "'{entry}' not found in scratch directory"
        )));
    }

    let run_cmd = language.run_command();
    debug!(?run_cmd, "executing program");

    let command = SandboxCommand::new(run_cmd)
        .limits(effective_limits)
        .address_space_limit(language.run.address_space_limit)
        .search_path(&language.run.path)
        .envs(&language.run.env)
        .isolation(runner.isolation().clone());

    let result = run_batch(scratch, command, input, runner.supervision()).await?;

    debug!(
        status = ?result.status,
        limit = ?result.limit_exceeded,
        wall_time_ms = result.wall_time_ms,
        memory_kb = result.memory_kb,
        exit_code = ?result.exit_code,
        "execution complete"
    );

    Ok(result)
}

/// Run one test case in its own pool slot and scratch directory.
///
/// The build artifacts are copied out of `build` first. A failure of the host
/// (scratch directory, spawn) is retried once; the verdict of a run that did
/// happen is never retried.
#[instrument(skip_all, fields(index = index))]
pub async fn run_test_case(
    runner: &Runner,
    pool: &WorkerPool,
    build: &ScratchDir,
    plan: &TestPlan,
    index: usize,
    case: &TestCase,
) -> Result<TestCaseResult, ExecuteError> {
    let result = retry_infrastructure("test case", ExecuteError::is_infrastructure, move || {
        run_once(runner, pool, build, plan, case)
    })
    .await?;
    Ok(judge_output(index, case, &result, plan))
}

async fn run_once(
    runner: &Runner,
    pool: &WorkerPool,
    build: &ScratchDir,
    plan: &TestPlan,
    case: &TestCase,
) -> Result<ExecutionResult, ExecuteError> {
    let lease = pool.acquire().await?;
    lease.scratch().stage_from(build).await?;

    let result = execute(
        runner,
        lease.scratch(),
        &plan.language,
        Some(case.input.as_bytes()),
        Some(&plan.limits),
    )
    .await;

    if let Err(e) = lease.cleanup().await {
        warn!(error = %e, "failed to remove scratch directory");
    }
    result
}

/// Map a finished run onto the result of its test case
pub fn judge_output(
    index: usize,
    case: &TestCase,
    result: &ExecutionResult,
    plan: &TestPlan,
) -> TestCaseResult {
    let error_kind = match result.limit_exceeded {
        LimitExceeded::WallTime => ErrorKind::Timeout,
        LimitExceeded::Memory => ErrorKind::MemoryExceeded,
        _ if result.status == ExecutionStatus::TimeLimitExceeded => ErrorKind::Timeout,
        _ if !result.is_success() => ErrorKind::RuntimeError,
        _ => ErrorKind::None,
    };

    let passed = error_kind == ErrorKind::None
        && plan
            .comparison
            .matches(&result.stdout, case.expected_output.as_bytes());

    let error_message = (error_kind == ErrorKind::RuntimeError).then(|| runtime_error_message(result));

    TestCaseResult {
        index,
        passed,
        actual_output: truncate_lossy(&result.stdout, plan.report_output_bytes),
        exec_time_ms: result.wall_time_ms,
        memory_mb: result.memory_mb(),
        error_kind,
        truncated: result.stdout_truncated,
        error_message,
    }
}

fn runtime_error_message(result: &ExecutionResult) -> String {
    let stderr = truncate_lossy(&result.stderr, STDERR_EXCERPT_BYTES);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    match (result.exit_code, result.signal) {
        (_, Some(signal)) => format!("killed by signal {signal}"),
        (Some(code), None) => format!("exited with code {code}"),
        (None, None) => result
            .message
            .clone()
            .unwrap_or_else(|| "runtime error".to_string()),
    }
}

/// Lossy UTF-8 of at most `max` bytes, cut on a character boundary
fn truncate_lossy(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(max)]);
    let mut text = text.into_owned();
    // a cut through a multi-byte sequence decodes to one trailing U+FFFD
    if bytes.len() > max && text.ends_with('\u{FFFD}') {
        text.pop();
    }
    text
}
