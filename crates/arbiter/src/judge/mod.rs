//! Judge orchestrator
//!
//! Turns a [`JudgeRequest`] into a [`JudgeResult`]: validate, compile once,
//! run every test case in its own sandbox on the worker pool, aggregate.
//! Faults never escape as errors; every failure becomes a verdict of `error`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use crate::judge::aggregate::aggregate;
pub use crate::judge::request::{
    DEFAULT_MEMORY_LIMIT_MB, DEFAULT_TIME_LIMIT_MS, ErrorKind, JudgeRequest, JudgeResult,
    JudgeStatus, TestCase, TestCaseResult,
};

mod aggregate;
mod request;

use crate::config::{Config, JudgeSettings, Language, LanguageRegistry};
use crate::runner::{CompileError, ExecuteError, Runner, TestPlan, retry_infrastructure};
use crate::sandbox::{IsolationOptions, SandboxError, ScratchDir, Supervision, WorkerPool};
use crate::types::ResourceLimits;

/// Reasons a request ends with a verdict of `error`
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("internal error: {0}")]
    Execute(#[from] ExecuteError),

    #[error("internal error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("internal error: test case task failed: {0}")]
    Task(#[from] JoinError),

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("request cancelled")]
    Cancelled,
}

impl JudgeError {
    /// Error taxonomy name, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            JudgeError::Validation(_) => "validation_error",
            JudgeError::Compile(e) if e.is_infrastructure() => "infrastructure_error",
            JudgeError::Compile(_) => "compile_error",
            JudgeError::Execute(_) | JudgeError::Sandbox(_) | JudgeError::Task(_) => {
                "infrastructure_error"
            }
            JudgeError::DeadlineExceeded => "deadline_exceeded",
            JudgeError::Cancelled => "cancelled",
        }
    }

    /// Whether the host failed and the step is worth one more attempt
    pub fn is_infrastructure(&self) -> bool {
        match self {
            JudgeError::Compile(e) => e.is_infrastructure(),
            JudgeError::Execute(e) => e.is_infrastructure(),
            JudgeError::Sandbox(e) => e.is_infrastructure(),
            _ => false,
        }
    }

    /// Message reported in `errorMessage`
    pub fn user_message(&self) -> String {
        match self {
            JudgeError::Compile(e) => e.user_message(),
            other => other.to_string(),
        }
    }

    /// The verdict for a request that failed this way
    pub fn into_result(self, tests_total: usize) -> JudgeResult {
        JudgeResult::error(self.user_message(), tests_total)
    }
}

/// Lifecycle stages of a request, traced as it moves through the judge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Validating,
    Compiling,
    Running,
    Aggregated,
    Returned,
    Errored,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Validating => "validating",
            Stage::Compiling => "compiling",
            Stage::Running => "running",
            Stage::Aggregated => "aggregated",
            Stage::Returned => "returned",
            Stage::Errored => "errored",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enter(stage: Stage) {
    debug!(stage = %stage, "judge stage");
}

/// Judge orchestrator
///
/// Owns the worker pool and the language registry. Cloning is cheap and
/// clones share the pool, so one judge can serve concurrent requests.
#[derive(Debug, Clone)]
pub struct Judge {
    runner: Runner,
    pool: WorkerPool,
    registry: LanguageRegistry,
    settings: JudgeSettings,
}

impl Judge {
    /// Create a judge without cgroup limits
    pub fn new(config: Config) -> Self {
        Self::with_cgroup(config, false)
    }

    /// Create a judge; `cgroup_ready` is the outcome of
    /// [`prepare_cgroup`](crate::sandbox::prepare_cgroup)
    pub fn with_cgroup(config: Config, cgroup_ready: bool) -> Self {
        let supervision = Supervision::from_config(&config, cgroup_ready);
        let isolation = IsolationOptions::from_settings(&config.sandbox);

        let wants_namespaces = config.sandbox.deny_network || config.sandbox.confine_filesystem;
        if wants_namespaces && !IsolationOptions::namespaces_available() {
            if config.sandbox.strict_isolation {
                warn!("namespaces unavailable, every run will fail under strict isolation");
            } else {
                warn!("namespaces unavailable, programs may reach the network and the host filesystem");
            }
        }

        let pool = WorkerPool::new(config.worker_count(), &config.scratch_root)
            .with_owner(isolation.scratch_owner());
        let registry = config.registry();
        let settings = config.judge.clone();

        debug!(
            workers = pool.capacity(),
            languages = registry.len(),
            cgroup = supervision.cgroup_root.is_some(),
            "judge ready"
        );

        Self {
            runner: Runner::new(config, supervision),
            pool,
            registry,
            settings,
        }
    }

    /// Languages this judge accepts
    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// The worker pool shared by all requests
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The runner used for compile and run steps
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Judge a submission
    pub async fn judge(&self, request: JudgeRequest) -> JudgeResult {
        self.judge_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Judge a submission, giving up when `cancel` fires.
    ///
    /// Cancellation, the request deadline and dropping the returned future
    /// all abort in-flight test cases; their process groups are killed and
    /// scratch directories removed.
    #[instrument(
        skip_all,
        fields(
            request_id = %Uuid::new_v4(),
            language = %request.language,
            cases = request.test_cases.len(),
        )
    )]
    pub async fn judge_with_cancel(
        &self,
        request: JudgeRequest,
        cancel: CancellationToken,
    ) -> JudgeResult {
        enter(Stage::Received);
        let tests_total = request.test_cases.len();

        let work = with_deadline(self.try_judge(request), self.settings.request_deadline_ms);
        let outcome = tokio::select! {
            outcome = work => outcome,
            _ = cancel.cancelled() => Err(JudgeError::Cancelled),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                enter(Stage::Errored);
                warn!(kind = e.kind(), error = %e, "request ended with error");
                e.into_result(tests_total)
            }
        };

        info!(
            status = ?result.status,
            passed = result.tests_passed,
            total = result.tests_total,
            exec_time_ms = result.exec_time_ms,
            memory_mb = result.memory_mb,
            "judged"
        );
        enter(Stage::Returned);
        result
    }

    async fn try_judge(&self, request: JudgeRequest) -> Result<JudgeResult, JudgeError> {
        enter(Stage::Validating);
        let plan = self.validate(&request)?;
        let fail_fast = request.fail_fast.unwrap_or(self.settings.fail_fast);
        let tests_total = request.test_cases.len();

        let build = Arc::new(self.prepare_build(&plan.language, request.code.as_bytes()).await?);

        enter(Stage::Running);
        let results = self
            .run_cases(Arc::clone(&build), Arc::new(plan), request.test_cases, fail_fast)
            .await;

        if let Ok(mut build) = Arc::try_unwrap(build)
            && let Err(e) = build.cleanup().await
        {
            warn!(error = %e, "failed to remove build directory");
        }

        let verdict = aggregate(results?, tests_total);
        enter(Stage::Aggregated);
        Ok(verdict)
    }

    /// Check a request before any sandbox exists
    fn validate(&self, request: &JudgeRequest) -> Result<TestPlan, JudgeError> {
        if request.test_cases.is_empty() {
            return Err(JudgeError::Validation(
                "at least one test case is required".to_string(),
            ));
        }
        if request.test_cases.len() > self.settings.max_test_cases {
            return Err(JudgeError::Validation(format!(
                "too many test cases: {} (max {})",
                request.test_cases.len(),
                self.settings.max_test_cases
            )));
        }
        if request.code.len() > self.settings.max_code_bytes {
            return Err(JudgeError::Validation(format!(
                "source code too large: {} bytes (max {})",
                request.code.len(),
                self.settings.max_code_bytes
            )));
        }

        let time_limit_ms = positive(request.time_limit_ms, "timeLimitMs")?;
        let memory_limit_mb = positive(request.memory_limit_mb, "memoryLimitMb")?;

        let language = self.registry.resolve(&request.language).map_err(|_| {
            JudgeError::Validation(format!("unsupported language: {}", request.language))
        })?;

        Ok(TestPlan {
            language: language.clone(),
            limits: ResourceLimits::unset()
                .with_time_limit_ms(time_limit_ms)
                .with_memory_limit_mb(memory_limit_mb),
            comparison: self.settings.comparison,
            report_output_bytes: self.settings.report_output_bytes,
        })
    }

    /// Write the source into a build directory and compile it there.
    ///
    /// The directory keeps the artifacts (or, for interpreted languages, the
    /// source) that every test case run copies.
    async fn prepare_build(&self, language: &Language, code: &[u8]) -> Result<ScratchDir, JudgeError> {
        retry_infrastructure("build", JudgeError::is_infrastructure, move || {
            self.build_once(language, code)
        })
        .await
    }

    async fn build_once(&self, language: &Language, code: &[u8]) -> Result<ScratchDir, JudgeError> {
        let lease = self.pool.acquire().await?;
        self.runner
            .write_source(lease.scratch(), code, language)
            .await?;

        if language.is_compiled() {
            enter(Stage::Compiling);
            let compiled = match self.runner.compile(lease.scratch(), language).await {
                Ok(compiled) => compiled,
                Err(e) => {
                    let _ = lease.cleanup().await;
                    return Err(e.into());
                }
            };
            if !compiled.is_success() {
                debug!(output = %compiled.output, "compilation failed");
                let _ = lease.cleanup().await;
                return Err(compiled.into_error().into());
            }
        }

        Ok(lease.into_scratch())
    }

    /// Run every case as its own task and collect results in input order.
    ///
    /// With `fail_fast`, a failure at index `i` aborts the cases after `i`;
    /// cases before it still finish, so the verdict is always that of the
    /// first failing case in input order.
    async fn run_cases(
        &self,
        build: Arc<ScratchDir>,
        plan: Arc<TestPlan>,
        cases: Vec<TestCase>,
        fail_fast: bool,
    ) -> Result<Vec<TestCaseResult>, JudgeError> {
        let mut tasks = JoinSet::new();
        let mut handles = Vec::with_capacity(cases.len());

        for (index, case) in cases.into_iter().enumerate() {
            let runner = self.runner.clone();
            let pool = self.pool.clone();
            let build = Arc::clone(&build);
            let plan = Arc::clone(&plan);
            handles.push(tasks.spawn(async move {
                let result = runner
                    .run_test_case(&pool, &build, &plan, index, &case)
                    .await;
                (index, result)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_failure: Option<usize> = None;

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => return Err(e.into()),
            };
            let result = result?;

            if fail_fast && result.is_failure() && first_failure.is_none_or(|first| index < first) {
                debug!(index, "fail-fast: aborting later test cases");
                first_failure = Some(index);
                for handle in &handles[index + 1..] {
                    handle.abort();
                }
            }
            results.push(result);
        }

        if let Some(cutoff) = first_failure {
            results.retain(|r| r.index <= cutoff);
        }
        results.sort_by_key(|r| r.index);
        Ok(results)
    }
}

fn positive(value: i64, name: &str) -> Result<u64, JudgeError> {
    u64::try_from(value)
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| JudgeError::Validation(format!("{name} must be positive, got {value}")))
}

async fn with_deadline<F>(work: F, deadline_ms: Option<u64>) -> Result<JudgeResult, JudgeError>
where
    F: Future<Output = Result<JudgeResult, JudgeError>>,
{
    match deadline_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), work)
            .await
            .unwrap_or(Err(JudgeError::DeadlineExceeded)),
        None => work.await,
    }
}
