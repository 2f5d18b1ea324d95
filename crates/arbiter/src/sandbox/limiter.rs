//! Resource limiting
//!
//! Two layers: rlimits the child sets on itself before exec ([`RlimitPlan`]),
//! and a supervisor in the parent that enforces the wall clock and memory
//! ceiling and kills the whole process group on violation ([`supervise`]).

use std::io;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::{debug, trace, warn};

use crate::sandbox::ExecutionCgroup;
use crate::types::ResourceLimits;

/// Rlimits applied in the child before exec, all in bytes or counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RlimitPlan {
    /// RLIMIT_AS
    pub address_space: Option<u64>,
    /// RLIMIT_CPU soft limit in seconds; the hard limit is one second above
    pub cpu_seconds: Option<u64>,
    /// RLIMIT_FSIZE
    pub file_size: Option<u64>,
    /// RLIMIT_NOFILE
    pub open_files: Option<u64>,
    /// RLIMIT_STACK
    pub stack: Option<u64>,
    /// RLIMIT_NPROC
    pub processes: Option<u64>,
}

impl RlimitPlan {
    /// Derive the rlimits for a run.
    ///
    /// `address_space` caps virtual memory at the memory limit. The CPU limit
    /// is a backstop behind the wall clock: the time limit rounded up to whole
    /// seconds plus one.
    pub fn from_limits(limits: &ResourceLimits, address_space: bool) -> Self {
        Self {
            address_space: limits
                .memory_limit_mb
                .filter(|_| address_space)
                .map(|mb| mb.saturating_mul(ResourceLimits::MB)),
            cpu_seconds: limits
                .time_limit_ms
                .map(|ms| ms.div_ceil(1000).saturating_add(1)),
            file_size: limits
                .max_file_size_kb
                .map(|kb| kb.saturating_mul(ResourceLimits::KB)),
            open_files: limits.max_open_files.map(u64::from),
            stack: limits
                .stack_limit_mb
                .map(|mb| mb.saturating_mul(ResourceLimits::MB)),
            processes: limits.max_processes.map(u64::from),
        }
    }

    /// Apply the plan to the calling process.
    ///
    /// RLIMIT_NPROC counts every process of the real user, so it is only set
    /// when that count is private to the run (`isolated_processes`): a
    /// dedicated user, or a user namespace of the child's own.
    ///
    /// Runs in the forked child; only raw syscalls.
    pub(crate) fn apply(&self, isolated_processes: bool) -> io::Result<()> {
        set_rlimit(libc::RLIMIT_CORE, 0, 0)?;

        if let Some(bytes) = self.address_space {
            set_rlimit(libc::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(secs) = self.cpu_seconds {
            set_rlimit(libc::RLIMIT_CPU, secs, secs.saturating_add(1))?;
        }
        if let Some(bytes) = self.file_size {
            set_rlimit(libc::RLIMIT_FSIZE, bytes, bytes)?;
        }
        if let Some(count) = self.open_files {
            set_rlimit(libc::RLIMIT_NOFILE, count, count)?;
        }
        if let Some(bytes) = self.stack {
            set_rlimit(libc::RLIMIT_STACK, bytes, bytes)?;
        }
        if let Some(count) = self.processes.filter(|_| isolated_processes) {
            set_rlimit(libc::RLIMIT_NPROC, count, count)?;
        }
        Ok(())
    }
}

#[cfg(target_env = "gnu")]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(target_env = "gnu"))]
type Resource = libc::c_int;

fn set_rlimit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    // SAFETY: setrlimit reads a fully initialised struct
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// SIGKILL every process in a process group.
///
/// A group that is already gone is not an error.
pub fn kill_process_group(pgid: i32) {
    if pgid <= 0 {
        return;
    }
    // SAFETY: killpg with a positive group id only signals that group
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, error = %err, "failed to kill process group");
        }
    }
}

/// What the supervisor enforces for one run
#[derive(Debug, Clone, Copy)]
pub(crate) struct Enforcement {
    /// Wall clock budget measured from spawn
    pub deadline: Option<Duration>,
    /// Memory ceiling in kilobytes
    pub memory_limit_kb: Option<u64>,
    /// How often memory is sampled
    pub poll_interval: Duration,
}

/// Outcome of supervising a child until it exited or was killed
#[derive(Debug, Clone, Copy)]
pub struct Supervised {
    pub status: ExitStatus,
    /// Wall clock from spawn to exit
    pub elapsed: Duration,
    /// The wall clock deadline fired
    pub timed_out: bool,
    /// Sampled memory went over the ceiling
    pub memory_exceeded: bool,
    /// Highest memory sample, in kilobytes
    pub peak_memory_kb: u64,
}

/// Wait for `child` while enforcing the wall clock and memory ceiling.
///
/// On violation the whole group (and cgroup, if any) is killed and the child
/// reaped before returning.
pub(crate) async fn supervise(
    child: &mut Child,
    pgid: i32,
    started: Instant,
    enforcement: Enforcement,
    cgroup: Option<&ExecutionCgroup>,
) -> io::Result<Supervised> {
    let deadline = enforcement
        .deadline
        .map(|d| tokio::time::Instant::from_std(started + d));
    let mut ticker = tokio::time::interval(enforcement.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut timed_out = false;
    let mut memory_exceeded = false;
    let mut peak_memory_kb = 0u64;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = sleep_until(deadline) => {
                debug!(pgid, "wall clock limit reached, killing process group");
                timed_out = true;
                terminate(pgid, cgroup);
                break child.wait().await?;
            }
            _ = ticker.tick() => {
                let sample = sample_memory_kb(pgid, cgroup).await;
                peak_memory_kb = peak_memory_kb.max(sample);
                trace!(pgid, sample_kb = sample, "memory sample");

                if let Some(limit) = enforcement.memory_limit_kb
                    && sample > limit
                {
                    debug!(pgid, sample_kb = sample, limit_kb = limit, "memory limit exceeded, killing process group");
                    memory_exceeded = true;
                    terminate(pgid, cgroup);
                    break child.wait().await?;
                }
            }
        }
    };

    Ok(Supervised {
        status,
        elapsed: started.elapsed(),
        timed_out,
        memory_exceeded,
        peak_memory_kb,
    })
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn terminate(pgid: i32, cgroup: Option<&ExecutionCgroup>) {
    kill_process_group(pgid);
    if let Some(cgroup) = cgroup {
        cgroup.kill();
    }
}

async fn sample_memory_kb(pgid: i32, cgroup: Option<&ExecutionCgroup>) -> u64 {
    if let Some(cgroup) = cgroup
        && let Some(kb) = cgroup.current_kb()
    {
        return kb;
    }
    tokio::task::spawn_blocking(move || group_memory_kb(pgid))
        .await
        .unwrap_or(0)
}

/// Memory of a process group in kilobytes, from `/proc`.
///
/// The larger of the summed resident set and the highest single-process
/// high-water mark, so a spike between two samples is still seen.
pub(crate) fn group_memory_kb(pgid: i32) -> u64 {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };

    let mut rss_sum = 0u64;
    let mut hwm_max = 0u64;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        if parse_pgrp(&stat) != Some(pgid) {
            continue;
        }
        let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
            continue;
        };
        let (rss, hwm) = parse_status_memory(&status);
        rss_sum = rss_sum.saturating_add(rss);
        hwm_max = hwm_max.max(hwm);
    }
    rss_sum.max(hwm_max)
}

/// Process group id from the contents of `/proc/<pid>/stat`.
///
/// The command name may contain spaces and parentheses, so fields are counted
/// from the last `)`: state, ppid, pgrp.
fn parse_pgrp(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(2)?.parse().ok()
}

/// `(VmRSS, VmHWM)` in kilobytes from the contents of `/proc/<pid>/status`
fn parse_status_memory(status: &str) -> (u64, u64) {
    let field = |key: &str| {
        status
            .lines()
            .find_map(|line| line.strip_prefix(key))
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };
    (field("VmRSS:"), field("VmHWM:"))
}
