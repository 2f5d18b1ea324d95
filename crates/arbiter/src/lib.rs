//! A library for judging untrusted submissions.
//!
//! Arbiter compiles a submission once, runs it against every test case in its
//! own sandboxed scratch directory, compares the output and folds the results
//! into a single verdict. It has an async Rust API on top of tokio and is
//! configured per language in TOML.
//!
//! # Features
//!
//! - **Process sandbox**: process groups, rlimits, user, network and mount
//!   namespaces, a private root where only the scratch directory is
//!   writable, and an optional dedicated user, with the group killed on
//!   every exit path.
//! - **Multi-language**: compiled and interpreted languages as config entries.
//! - **Bounded concurrency**: a worker pool caps simultaneous programs.
//! - **Resource limits**: wall clock, memory, processes, output and file size.
//! - **cgroup v2 support**: hard memory and pid limits where available.

pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language, LanguageRegistry};
pub use judge::{
    ErrorKind, Judge, JudgeError, JudgeRequest, JudgeResult, JudgeStatus, TestCase,
    TestCaseResult,
};
pub use runner::{ComparisonPolicy, CompileError, CompileResult, ExecuteError, Runner};
pub use sandbox::{SandboxError, ScratchDir, WorkerPool, prepare_cgroup};
pub use types::{ExecutionResult, ExecutionStatus, LimitExceeded, ResourceLimits};

pub mod config;
pub mod judge;
pub mod runner;
pub mod sandbox;
pub mod types;
