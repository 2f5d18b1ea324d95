//! Process sandbox
//!
//! Runs one untrusted program per scratch directory: no network, a private
//! root where only that directory is writable, capped memory, processes and
//! output, wall clock enforced by the limiter, and the whole process group
//! killed and reaped on every exit path.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use crate::sandbox::cgroup::{ExecutionCgroup, prepare_cgroup};
pub use crate::sandbox::command::SandboxCommand;
pub use crate::sandbox::isolation::{IsolationOptions, NOBODY};
pub use crate::sandbox::limiter::{RlimitPlan, Supervised, kill_process_group};
pub use crate::sandbox::mount::DEFAULT_READONLY_PATHS;
pub use crate::sandbox::pool::{Lease, WorkerPool};
pub use crate::sandbox::process::{Supervision, read_to_end_capped, run_batch, run_with_output};
pub use crate::sandbox::workspace::ScratchDir;

mod cgroup;
mod command;
mod isolation;
mod limiter;
mod mount;
mod pool;
mod process;
mod workspace;

/// Errors that occur while creating or driving a sandbox
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create scratch directory {path}: {source}")]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn sandboxed process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("cgroup setup failed: {0}")]
    Cgroup(String),

    #[error("command '{0}' not found in PATH")]
    CommandNotFound(String),

    #[error("empty command")]
    EmptyCommand,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("worker pool is closed")]
    PoolClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Whether the failure came from host pressure rather than the submission
    /// or the configuration, and is worth one more attempt.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            SandboxError::ScratchDir { .. }
                | SandboxError::SpawnFailed(_)
                | SandboxError::Cgroup(_)
                | SandboxError::Io(_)
        )
    }
}

/// Resolve the program in a command to an absolute path.
///
/// The child runs with a cleared environment, so bare names (like `g++`) are
/// looked up in the sandbox `search_path` here, where a missing toolchain can
/// be reported as a configuration problem instead of a spawn failure.
///
/// Commands that already contain a `/` (like `./main`) are left unchanged.
pub fn resolve_command(command: &mut [String], search_path: &str) -> Result<(), SandboxError> {
    let first = match command.first_mut() {
        Some(first) => first,
        None => return Err(SandboxError::EmptyCommand),
    };

    if first.contains('/') {
        return Ok(());
    }

    for dir in search_path.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(&*first);
        if is_executable(&candidate) {
            *first = candidate.to_string_lossy().into_owned();
            return Ok(());
        }
    }

    Err(SandboxError::CommandNotFound(first.clone()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_bare_command() {
        let mut cmd = vec!["sh".to_string(), "-c".to_string(), "true".to_string()];
        resolve_command(&mut cmd, "/usr/bin:/bin").unwrap();
        assert!(cmd[0].starts_with('/'));
        assert_eq!(cmd[1], "-c");
    }

    #[test]
    fn resolve_leaves_paths_alone() {
        let mut cmd = vec!["./main".to_string()];
        resolve_command(&mut cmd, "/usr/bin:/bin").unwrap();
        assert_eq!(cmd, vec!["./main"]);
    }

    #[test]
    fn resolve_missing_command() {
        let mut cmd = vec!["definitely-not-a-real-compiler".to_string()];
        let err = resolve_command(&mut cmd, "/usr/bin:/bin").unwrap_err();
        assert!(matches!(err, SandboxError::CommandNotFound(_)));
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn resolve_empty_command() {
        let mut cmd: Vec<String> = Vec::new();
        assert!(matches!(
            resolve_command(&mut cmd, "/bin"),
            Err(SandboxError::EmptyCommand)
        ));
    }

    #[test]
    fn infrastructure_classification() {
        let spawn = SandboxError::SpawnFailed(std::io::Error::other("EAGAIN"));
        assert!(spawn.is_infrastructure());
        assert!(SandboxError::Cgroup("no memory controller".into()).is_infrastructure());
        assert!(!SandboxError::InvalidPath("../x".into()).is_infrastructure());
        assert!(!SandboxError::PoolClosed.is_infrastructure());
    }
}
