//! Child-side isolation applied between fork and exec

use std::ffi::{CStr, CString};
use std::os::unix::fs::MetadataExt;
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

use crate::config::SandboxSettings;
use crate::sandbox::limiter::RlimitPlan;
use crate::sandbox::mount::MountPlan;

/// Isolation applied to every sandboxed process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsolationOptions {
    /// Move the child into a fresh, empty network namespace
    pub deny_network: bool,

    /// Pivot the child into a private root where only its scratch directory
    /// is writable
    pub confine_filesystem: bool,

    /// Host paths visible read-only inside the private root
    pub readonly_paths: Vec<PathBuf>,

    /// Fail the spawn instead of running without the namespaces above or
    /// without a process cap
    pub strict: bool,

    /// Niceness for the child
    pub nice: i32,

    /// CPUs the child may run on (empty: inherit)
    pub cpu_affinity: Vec<usize>,

    /// Dedicated user to switch to before exec
    pub uid: Option<u32>,

    /// Group to switch to before exec (defaults to `uid`)
    pub gid: Option<u32>,
}

impl IsolationOptions {
    /// No isolation at all
    pub fn none() -> Self {
        Self::default()
    }

    /// Isolation configured by the `[sandbox]` settings
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self {
            deny_network: settings.deny_network,
            confine_filesystem: settings.confine_filesystem,
            readonly_paths: settings.readonly_paths.clone(),
            strict: settings.strict_isolation,
            nice: settings.nice,
            cpu_affinity: settings.cpu_affinity.clone(),
            uid: settings.uid,
            gid: settings.gid,
        }
    }

    /// The uid/gid pair programs run as, if a dedicated user is configured
    pub fn credentials(&self) -> Option<(u32, u32)> {
        self.uid.map(|uid| (uid, self.gid.unwrap_or(uid)))
    }

    /// Owner for scratch directories.
    ///
    /// The dedicated user if there is one. A root server without one hands
    /// the directories to [`NOBODY`], which its programs then run as.
    pub fn scratch_owner(&self) -> Option<(u32, u32)> {
        self.credentials()
            .or_else(|| server_is_root().then_some((NOBODY, NOBODY)))
    }

    /// Whether namespaces can be created from this process.
    ///
    /// Root can always unshare; an unprivileged server needs user namespaces.
    pub fn namespaces_available() -> bool {
        if server_is_root() {
            return true;
        }

        let max_userns = std::fs::read_to_string("/proc/sys/user/max_user_namespaces")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);
        let userns_clone = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone")
            .map(|s| s.trim() != "0")
            .unwrap_or(true);

        max_userns > 0 && userns_clone
    }
}

/// Id used for programs of a root server that has no dedicated user
pub const NOBODY: u32 = 65534;

/// Id maps written after entering a user namespace.
///
/// An unprivileged server maps its own ids to themselves. A root server also
/// maps the user the program runs as and switches to it inside the
/// namespace: the kernel never applies RLIMIT_NPROC to root.
struct IdMaps {
    uid_map: CString,
    gid_map: CString,
    /// Unprivileged writers must give up setgroups before writing gid_map
    deny_setgroups: bool,
    /// Ids to switch to once the namespace is set up
    run_as: Option<(u32, u32)>,
}

impl IdMaps {
    fn new(run_as: Option<(u32, u32)>) -> Self {
        // SAFETY: geteuid and getegid have no preconditions
        let (euid, egid) = unsafe { (libc::geteuid(), libc::getegid()) };
        let map = |own: u32, target: Option<u32>| {
            let lines = match target {
                Some(id) if euid == 0 && id != own => format!("{own} {own} 1\n{id} {id} 1"),
                _ => format!("{own} {own} 1"),
            };
            CString::new(lines).unwrap_or_default()
        };
        Self {
            uid_map: map(euid, run_as.map(|(uid, _)| uid)),
            gid_map: map(egid, run_as.map(|(_, gid)| gid)),
            deny_setgroups: euid != 0,
            run_as,
        }
    }

    fn write(&self) -> io::Result<()> {
        if self.deny_setgroups {
            match write_proc(c"/proc/self/setgroups", c"deny") {
                Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                other => other?,
            }
        }
        write_proc(c"/proc/self/uid_map", &self.uid_map)?;
        write_proc(c"/proc/self/gid_map", &self.gid_map)
    }
}

fn write_proc(path: &CStr, contents: &CStr) -> io::Result<()> {
    let bytes = contents.to_bytes();
    // SAFETY: NUL-terminated path; the descriptor is closed before returning
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let written = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
        let err = io::Error::last_os_error();
        libc::close(fd);
        if written < 0 {
            return Err(err);
        }
    }
    Ok(())
}

fn server_is_root() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() == 0 }
}

/// Namespaces the child actually entered
#[derive(Debug, Clone, Copy, Default)]
struct Entered {
    mount: bool,
    user: bool,
}

/// Everything the forked child does to itself before exec.
///
/// Runs in the child after `fork`, so [`apply`](Self::apply) only issues raw
/// syscalls and never allocates or logs.
pub(crate) struct ChildSetup {
    pub isolation: IsolationOptions,
    pub rlimits: RlimitPlan,
    /// Open `cgroup.procs` of the execution cgroup, inherited across fork
    pub cgroup_procs: Option<RawFd>,
    /// CPU mask built in the parent
    cpu_set: Option<libc::cpu_set_t>,
    /// Private root, when the filesystem is confined
    mounts: Option<MountPlan>,
    /// Set when the child enters a user namespace of its own
    id_maps: Option<IdMaps>,
}

impl ChildSetup {
    pub fn new(
        isolation: IsolationOptions,
        rlimits: RlimitPlan,
        cgroup_procs: Option<RawFd>,
        working_dir: &Path,
    ) -> io::Result<Self> {
        let cpu_set = build_cpu_set(&isolation.cpu_affinity);
        let mounts = if isolation.confine_filesystem {
            Some(MountPlan::new(working_dir, &isolation.readonly_paths)?)
        } else {
            None
        };

        // A root server without a dedicated user runs programs as the owner
        // of their scratch directory
        let run_as = isolation.credentials().or_else(|| {
            let meta = std::fs::metadata(working_dir).ok()?;
            (server_is_root() && meta.uid() != 0).then(|| (meta.uid(), meta.gid()))
        });
        if isolation.strict
            && rlimits.processes.is_some()
            && cgroup_procs.is_none()
            && server_is_root()
            && run_as.is_none()
        {
            return Err(io::Error::other(
                "cannot cap the process count of a root program without a cgroup",
            ));
        }

        let wants_namespace =
            isolation.deny_network || mounts.is_some() || rlimits.processes.is_some();
        let id_maps = wants_namespace.then(|| IdMaps::new(run_as));

        Ok(Self {
            isolation,
            rlimits,
            cgroup_procs,
            cpu_set,
            mounts,
            id_maps,
        })
    }

    /// Apply every step in order: cgroup, namespaces, private root,
    /// scheduling, rlimits, credentials.
    ///
    /// Credentials go last: unsharing, mounting and joining the cgroup need
    /// the server's privileges.
    pub fn apply(&self) -> io::Result<()> {
        if let Some(fd) = self.cgroup_procs {
            // "0" moves the writing process itself
            // SAFETY: fd is an open descriptor owned by the parent until spawn returns
            if unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }

        let entered = self.enter_namespaces()?;

        if let Some(ref mounts) = self.mounts
            && entered.mount
        {
            mounts.apply()?;
        }

        // SAFETY: plain syscalls on the calling process
        unsafe {
            if self.isolation.nice != 0
                && libc::setpriority(libc::PRIO_PROCESS, 0, self.isolation.nice) != 0
            {
                return Err(io::Error::last_os_error());
            }

            if let Some(ref set) = self.cpu_set
                && libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), set) != 0
            {
                return Err(io::Error::last_os_error());
            }
        }

        // Outside a user namespace or a dedicated user, RLIMIT_NPROC would
        // count every thread of the server's user.
        self.rlimits
            .apply(entered.user || self.isolation.uid.is_some())?;

        let run_as = match self.id_maps {
            Some(ref maps) if entered.user => maps.run_as,
            _ => self.isolation.credentials(),
        };
        if let Some((uid, gid)) = run_as {
            // SAFETY: plain syscalls on the calling process
            unsafe {
                if libc::setgroups(0, std::ptr::null()) != 0
                    || libc::setgid(gid as libc::gid_t) != 0
                    || libc::setuid(uid as libc::uid_t) != 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
        }

        Ok(())
    }

    fn enter_namespaces(&self) -> io::Result<Entered> {
        let mut flags = 0;
        if self.isolation.deny_network {
            flags |= libc::CLONE_NEWNET;
        }
        if self.mounts.is_some() {
            flags |= libc::CLONE_NEWNS;
        }

        if let Some(ref maps) = self.id_maps {
            // SAFETY: unshare only affects the calling (single-threaded) child
            if unsafe { libc::unshare(flags | libc::CLONE_NEWUSER) } == 0 {
                maps.write()?;
                return Ok(Entered {
                    mount: self.mounts.is_some(),
                    user: true,
                });
            }
            // Without it only a dedicated user or a cgroup caps processes
            let err = io::Error::last_os_error();
            if self.isolation.strict
                && self.rlimits.processes.is_some()
                && self.isolation.uid.is_none()
                && self.cgroup_procs.is_none()
            {
                return Err(err);
            }
        }

        if flags == 0 {
            return Ok(Entered::default());
        }

        // SAFETY: as above
        if unsafe { libc::unshare(flags) } == 0 {
            return Ok(Entered {
                mount: self.mounts.is_some(),
                user: false,
            });
        }

        if self.isolation.strict {
            return Err(io::Error::last_os_error());
        }
        Ok(Entered::default())
    }
}

fn build_cpu_set(cpus: &[usize]) -> Option<libc::cpu_set_t> {
    if cpus.is_empty() {
        return None;
    }

    // SAFETY: cpu_set_t is a plain bitmask, all-zero is the empty set
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let capacity = std::mem::size_of::<libc::cpu_set_t>() * 8;
    let mut any = false;
    for &cpu in cpus.iter().filter(|&&cpu| cpu < capacity) {
        // SAFETY: cpu is below the bitmask capacity
        unsafe { libc::CPU_SET(cpu, &mut set) };
        any = true;
    }
    any.then_some(set)
}
