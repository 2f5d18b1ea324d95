//! Process spawning and I/O for the sandbox
//!
//! Handles running commands in a scratch directory and capturing output.

use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::sandbox::limiter::{Enforcement, supervise};
use crate::sandbox::{ExecutionCgroup, SandboxCommand, SandboxError, ScratchDir, kill_process_group};
use crate::types::{ExecutionResult, ExecutionStatus, LimitExceeded};

/// How long output readers may keep draining after the child exited
const READER_GRACE: Duration = Duration::from_millis(500);

/// Host-wide supervision settings shared by every execution
#[derive(Debug, Clone)]
pub struct Supervision {
    /// Memory sampling interval
    pub poll_interval: Duration,

    /// Budget for writing stdin
    pub stdin_timeout: Duration,

    /// Root for per-execution cgroups, when cgroup limits are in use
    pub cgroup_root: Option<PathBuf>,
}

impl Supervision {
    /// Supervision as configured, with cgroups only if `cgroup_ready`
    pub fn from_config(config: &Config, cgroup_ready: bool) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.sandbox.memory_poll_interval_ms.max(1)),
            stdin_timeout: Duration::from_millis(config.sandbox.stdin_timeout_ms),
            cgroup_root: (config.cgroup && cgroup_ready).then(|| config.cg_root.clone()),
        }
    }
}

impl Default for Supervision {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(25),
            stdin_timeout: Duration::from_secs(1),
            cgroup_root: None,
        }
    }
}

/// Kills the process group when dropped, so a cancelled run leaves nothing
/// behind
struct ProcessGroupGuard(i32);

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        kill_process_group(self.0);
    }
}

/// Read a stream to the end, keeping at most `cap` bytes.
///
/// Reading continues past the cap so the writer never blocks on a full
/// pipe; the returned flag says whether anything was dropped.
pub async fn read_to_end_capped<R>(mut reader: R, cap: usize) -> std::io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }

        if truncated {
            continue;
        }

        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

/// Run a command in a scratch directory with batch I/O
///
/// `stdin_data` is fed by a separate writer task; stdout and stderr are
/// captured up to the output cap. Limit violations are reported in the
/// result, never as an error.
#[instrument(skip_all, fields(scratch = %scratch.id(), program = ?command.program().first()))]
pub async fn run_batch(
    scratch: &ScratchDir,
    command: SandboxCommand,
    stdin_data: Option<&[u8]>,
    supervision: &Supervision,
) -> Result<ExecutionResult, SandboxError> {
    let limits = command.get_limits().clone();
    let cap = limits.output_cap();
    let memory_limit_kb = limits.memory_limit_kb();

    let cgroup = match supervision.cgroup_root {
        Some(ref root) => Some(ExecutionCgroup::create(
            root,
            scratch.id(),
            limits.memory_limit_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
            limits.max_processes,
        )?),
        None => None,
    };
    let procs = cgroup.as_ref().map(ExecutionCgroup::open_procs).transpose()?;

    let mut cmd = command.build(scratch.path(), procs.as_ref().map(|f| f.as_raw_fd()))?;

    debug!("spawning sandboxed process");
    let mut child = cmd.spawn().map_err(SandboxError::SpawnFailed)?;
    let started = Instant::now();
    drop(procs);

    let pgid = child
        .id()
        .and_then(|pid| i32::try_from(pid).ok())
        .ok_or_else(|| SandboxError::SpawnFailed(std::io::Error::other("child exited before supervision")))?;
    let group = ProcessGroupGuard(pgid);

    let stdin_task = spawn_stdin_writer(
        child.stdin.take(),
        stdin_data.map(<[u8]>::to_vec).unwrap_or_default(),
        supervision.stdin_timeout,
    );
    let stdout_task = child.stdout.take().map(|out| tokio::spawn(read_to_end_capped(out, cap)));
    let stderr_task = child.stderr.take().map(|err| tokio::spawn(read_to_end_capped(err, cap)));

    let enforcement = Enforcement {
        deadline: limits.time_limit_ms.map(Duration::from_millis),
        memory_limit_kb,
        poll_interval: supervision.poll_interval,
    };
    let supervised = supervise(&mut child, pgid, started, enforcement, cgroup.as_ref()).await?;

    // descendants may still hold the pipes open
    drop(group);
    stdin_task.abort();

    let (stdout, stdout_truncated) = join_reader(stdout_task).await;
    let (stderr, stderr_truncated) = join_reader(stderr_task).await;

    let signal = supervised.status.signal();
    let timed_out = supervised.timed_out || signal == Some(libc::SIGXCPU);

    let mut memory_kb = supervised.peak_memory_kb;
    let mut oom_killed = false;
    if let Some(ref cgroup) = cgroup {
        memory_kb = memory_kb.max(cgroup.peak_kb().unwrap_or(0));
        oom_killed = cgroup.oom_killed();
    }

    let limit_exceeded = if timed_out {
        LimitExceeded::WallTime
    } else if supervised.memory_exceeded || oom_killed {
        LimitExceeded::Memory
    } else if stdout_truncated || stderr_truncated {
        LimitExceeded::Output
    } else {
        LimitExceeded::NotExceeded
    };

    let message = match limit_exceeded {
        LimitExceeded::WallTime => Some("time limit exceeded".to_string()),
        LimitExceeded::Memory => Some("memory limit exceeded".to_string()),
        LimitExceeded::Output => Some("output truncated".to_string()),
        LimitExceeded::NotExceeded => None,
    };

    let exit_code = supervised.status.code();
    let mut result = ExecutionResult {
        status: ExecutionStatus::from_exit(exit_code, signal, timed_out),
        limit_exceeded,
        wall_time_ms: u64::try_from(supervised.elapsed.as_millis()).unwrap_or(u64::MAX),
        memory_kb,
        exit_code,
        signal,
        message,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
    };

    if let Some(limit_kb) = memory_limit_kb
        && !result.limit_exceeded.is_fatal()
    {
        result.detect_memory_limit(limit_kb);
    }

    if let Some(cgroup) = cgroup
        && let Err(e) = cgroup.destroy().await
    {
        warn!(error = %e, "failed to remove execution cgroup");
    }

    debug!(
        status = ?result.status,
        limit = ?result.limit_exceeded,
        wall_time_ms = result.wall_time_ms,
        memory_kb = result.memory_kb,
        "execution complete"
    );

    Ok(result)
}

/// Run a command and capture output (for compilation feedback)
///
/// Returns the execution result together with stdout and stderr combined
/// into one text.
#[instrument(skip_all, fields(scratch = %scratch.id()))]
pub async fn run_with_output(
    scratch: &ScratchDir,
    command: SandboxCommand,
    supervision: &Supervision,
) -> Result<(ExecutionResult, String), SandboxError> {
    let result = run_batch(scratch, command, None, supervision).await?;

    let stdout = String::from_utf8_lossy(&result.stdout);
    let stderr = String::from_utf8_lossy(&result.stderr);
    let mut output = stdout.trim_end().to_string();
    if !output.is_empty() && !stderr.trim().is_empty() {
        output.push('\n');
    }
    output.push_str(stderr.trim_end());

    Ok((result, output))
}

fn spawn_stdin_writer(
    stdin: Option<tokio::process::ChildStdin>,
    data: Vec<u8>,
    budget: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut stdin) = stdin else {
            return;
        };
        let write = async {
            stdin.write_all(&data).await?;
            stdin.shutdown().await
        };
        match tokio::time::timeout(budget, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => debug!(error = %e, "stdin write failed"),
            Err(_) => debug!(len = data.len(), "stdin write timed out"),
        }
    })
}

async fn join_reader(task: Option<JoinHandle<std::io::Result<(Vec<u8>, bool)>>>) -> (Vec<u8>, bool) {
    let Some(mut task) = task else {
        return (Vec::new(), false);
    };
    match tokio::time::timeout(READER_GRACE, &mut task).await {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(e))) => {
            debug!(error = %e, "output read failed");
            (Vec::new(), false)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "output reader panicked");
            (Vec::new(), false)
        }
        Err(_) => {
            warn!("output pipe still open after exit, dropping capture");
            task.abort();
            (Vec::new(), true)
        }
    }
}
