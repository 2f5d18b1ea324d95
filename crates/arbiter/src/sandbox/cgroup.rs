//! cgroup v2 hard limits
//!
//! When enabled, every execution gets its own child cgroup under `cg_root`
//! with `memory.max`, `memory.swap.max` and `pids.max` set before the program
//! joins it. The kernel then enforces memory exactly and `memory.events`
//! tells whether the OOM killer fired.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::sandbox::SandboxError;

const CGROUP_BASE: &str = "/sys/fs/cgroup";

/// Attempt to set up the cgroup v2 hierarchy for per-execution cgroups.
///
/// Creates `cg_root` and enables the memory and pids controllers for its
/// children. In a container the server usually starts in the root cgroup, so
/// it first moves itself into a leaf (`init`) to satisfy the "no internal
/// processes" rule.
///
/// Returns `Ok(true)` if cgroups are ready, `Ok(false)` if cgroup v2 or the
/// memory controller is unavailable and the caller should fall back to
/// sampling.
pub fn prepare_cgroup(cg_root: &Path) -> Result<bool, SandboxError> {
    let cg_base = Path::new(CGROUP_BASE);

    let controllers_path = cg_base.join("cgroup.controllers");
    if !controllers_path.exists() {
        return Ok(false);
    }

    let controllers = fs::read_to_string(&controllers_path)?;
    if !has_controller(&controllers, "memory") {
        return Ok(false);
    }

    if cg_root.exists() {
        let subtree = cg_root.join("cgroup.subtree_control");
        if let Ok(content) = fs::read_to_string(&subtree)
            && has_controller(&content, "memory")
            && has_controller(&content, "pids")
        {
            return Ok(true);
        }
    }

    let init_cg = cg_base.join("init");
    if !init_cg.exists() {
        fs::create_dir(&init_cg)?;
    }
    fs::write(init_cg.join("cgroup.procs"), std::process::id().to_string())?;

    fs::write(cg_base.join("cgroup.subtree_control"), "+memory +pids")?;

    if !cg_root.exists() {
        fs::create_dir(cg_root)?;
    }
    fs::write(cg_root.join("cgroup.subtree_control"), "+memory +pids")?;

    Ok(true)
}

fn has_controller(list: &str, name: &str) -> bool {
    list.split_whitespace().any(|c| c == name)
}

/// A cgroup owned by one execution
///
/// Killed and removed by [`destroy()`](Self::destroy), or by `Drop` as a
/// fallback.
#[derive(Debug)]
pub struct ExecutionCgroup {
    path: PathBuf,
    removed: bool,
}

impl ExecutionCgroup {
    /// Create `cg_root/run-{id}` with the given limits.
    ///
    /// Swap is disabled so `memory.max` is a true ceiling.
    #[instrument(skip(cg_root), fields(cg_root = %cg_root.display()))]
    pub fn create(
        cg_root: &Path,
        id: Uuid,
        memory_bytes: Option<u64>,
        max_pids: Option<u32>,
    ) -> Result<Self, SandboxError> {
        let path = cg_root.join(format!("run-{id}"));
        fs::create_dir(&path).map_err(|e| cgroup_err(&path, "create", e))?;
        let cgroup = Self {
            path,
            removed: false,
        };

        if let Some(bytes) = memory_bytes {
            cgroup.write("memory.max", &bytes.to_string())?;
            // absent without swap accounting
            if cgroup.path.join("memory.swap.max").exists() {
                cgroup.write("memory.swap.max", "0")?;
            }
        }
        if let Some(pids) = max_pids {
            cgroup.write("pids.max", &pids.to_string())?;
        }

        debug!(path = %cgroup.path.display(), "execution cgroup created");
        Ok(cgroup)
    }

    /// Path of the cgroup directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open `cgroup.procs` for the child to write itself into
    pub fn open_procs(&self) -> Result<File, SandboxError> {
        let procs = self.path.join("cgroup.procs");
        OpenOptions::new()
            .write(true)
            .open(&procs)
            .map_err(|e| cgroup_err(&procs, "open", e))
    }

    /// Current memory usage in kilobytes
    pub fn current_kb(&self) -> Option<u64> {
        self.read_u64("memory.current").map(|b| b / 1024)
    }

    /// Peak memory usage in kilobytes (kernel 5.19+)
    pub fn peak_kb(&self) -> Option<u64> {
        self.read_u64("memory.peak").map(|b| b / 1024)
    }

    /// Whether the OOM killer killed a process in this cgroup
    pub fn oom_killed(&self) -> bool {
        fs::read_to_string(self.path.join("memory.events"))
            .ok()
            .and_then(|events| {
                events.lines().find_map(|line| {
                    line.strip_prefix("oom_kill ")
                        .and_then(|n| n.trim().parse::<u64>().ok())
                })
            })
            .is_some_and(|n| n > 0)
    }

    /// Kill every process in the cgroup
    pub fn kill(&self) {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return;
        }

        // cgroup.kill needs kernel 5.14
        if let Ok(procs) = fs::read_to_string(self.path.join("cgroup.procs")) {
            for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
                // SAFETY: signalling a pid read from our own cgroup
                unsafe { libc::kill(pid, libc::SIGKILL) };
            }
        }
    }

    /// Kill remaining processes and remove the cgroup
    pub async fn destroy(mut self) -> Result<(), SandboxError> {
        self.kill();

        // rmdir fails with EBUSY until the killed processes are gone
        let mut last_err = None;
        for _ in 0..20 {
            match fs::remove_dir(&self.path) {
                Ok(()) => {
                    self.removed = true;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.removed = true;
                    return Ok(());
                }
                Err(e) => last_err = Some(e),
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = last_err.unwrap_or_else(|| std::io::Error::other("cgroup busy"));
        Err(cgroup_err(&self.path, "remove", err))
    }

    fn write(&self, file: &str, value: &str) -> Result<(), SandboxError> {
        let path = self.path.join(file);
        fs::write(&path, value).map_err(|e| cgroup_err(&path, "write", e))
    }

    fn read_u64(&self, file: &str) -> Option<u64> {
        fs::read_to_string(self.path.join(file))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

impl Drop for ExecutionCgroup {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        self.kill();
        if let Err(e) = fs::remove_dir(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "execution cgroup left behind");
        }
    }
}

fn cgroup_err(path: &Path, action: &str, err: std::io::Error) -> SandboxError {
    SandboxError::Cgroup(format!("{action} {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_list_matching() {
        assert!(has_controller("cpuset cpu io memory pids", "memory"));
        assert!(has_controller("memory\n", "memory"));
        assert!(!has_controller("cpuset cpu io", "memory"));
        assert!(!has_controller("memoryx", "memory"));
    }

    #[test]
    fn create_outside_cgroupfs_fails() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("missing");
        let err = ExecutionCgroup::create(&missing, Uuid::new_v4(), Some(1024), None).unwrap_err();
        assert!(err.is_infrastructure());
    }

    #[test]
    fn reads_interface_files() {
        // a plain directory stands in for the cgroup
        let root = tempfile::tempdir().unwrap();
        let cgroup = ExecutionCgroup::create(root.path(), Uuid::new_v4(), Some(4096), Some(8)).unwrap();

        assert_eq!(fs::read_to_string(cgroup.path().join("memory.max")).unwrap(), "4096");
        assert_eq!(fs::read_to_string(cgroup.path().join("pids.max")).unwrap(), "8");

        fs::write(cgroup.path().join("memory.current"), "2048000\n").unwrap();
        fs::write(cgroup.path().join("memory.peak"), "4096000\n").unwrap();
        assert_eq!(cgroup.current_kb(), Some(2000));
        assert_eq!(cgroup.peak_kb(), Some(4000));

        assert!(!cgroup.oom_killed());
        fs::write(
            cgroup.path().join("memory.events"),
            "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n",
        )
        .unwrap();
        assert!(cgroup.oom_killed());

        // leave removal to the tempdir; a non-empty directory cannot be rmdir'ed
        std::mem::forget(cgroup);
    }
}
