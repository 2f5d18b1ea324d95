//! Filesystem confinement
//!
//! A confined child gets its own mount namespace whose root is a small tmpfs
//! mounted over the scratch directory. The tmpfs holds read-only binds of the
//! host paths a toolchain needs and one writable bind of the scratch
//! directory, at the same absolute path it has on the host so `HOME`,
//! `TMPDIR` and the working directory stay valid. After `pivot_root` the rest
//! of the host tree, sibling scratch directories included, is unreachable.
//!
//! The plan is built in the parent, where allocating and touching the
//! filesystem is fine; [`MountPlan::apply`] only issues syscalls on the
//! prepared C strings.

use std::collections::BTreeSet;
use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::ptr;

use tracing::trace;

/// Host paths exposed read-only inside a confined sandbox by default.
///
/// Missing entries are skipped. A trailing `*` matches every sibling with
/// that prefix.
pub const DEFAULT_READONLY_PATHS: &[&str] = &[
    "/bin",
    "/sbin",
    "/usr",
    "/lib",
    "/lib32",
    "/lib64",
    "/libx32",
    "/opt",
    "/etc/alternatives",
    "/etc/ld.so.cache",
    "/etc/ld.so.conf",
    "/etc/ld.so.conf.d",
    "/etc/localtime",
    "/etc/ssl",
    "/etc/java-*",
    "/dev/null",
    "/dev/zero",
    "/dev/full",
    "/dev/random",
    "/dev/urandom",
    "/proc",
];

/// Options for the tmpfs that becomes the new root
const ROOT_TMPFS_OPTIONS: &CStr = c"mode=0755,size=1m";

#[derive(Debug)]
enum Step {
    Mkdir(CString),
    Touch(CString),
    Symlink { target: CString, link: CString },
    Bind { source: CString, target: CString, writable: bool },
}

/// Mount operations that confine one child to its scratch directory
#[derive(Debug)]
pub(crate) struct MountPlan {
    /// Host path of the scratch directory, also the tmpfs mount point
    new_root: CString,
    steps: Vec<Step>,
    /// Working directory after the pivot
    workdir: CString,
    /// Keeps the scratch directory reachable once the tmpfs covers it
    _scratch: File,
}

impl MountPlan {
    /// Plan the private root for `scratch`, exposing `readonly_paths`.
    ///
    /// Paths that overlap the scratch directory, or sit under a path
    /// already exposed, are skipped.
    pub fn new(scratch: &Path, readonly_paths: &[PathBuf]) -> io::Result<Self> {
        let scratch_file = File::open(scratch)?;
        let mut builder = PlanBuilder {
            root: scratch.to_path_buf(),
            steps: Vec::new(),
            created: BTreeSet::new(),
            exposed: Vec::new(),
        };

        for path in expand_patterns(readonly_paths) {
            builder.expose(&path)?;
        }

        builder.mkdir_all(scratch)?;
        let source = format!("/proc/self/fd/{}", scratch_file.as_raw_fd());
        builder.steps.push(Step::Bind {
            source: c_string(Path::new(&source))?,
            target: c_string(&builder.inside(scratch))?,
            writable: true,
        });

        trace!(scratch = %scratch.display(), steps = builder.steps.len(), "mount plan ready");

        Ok(Self {
            new_root: c_string(scratch)?,
            steps: builder.steps,
            workdir: c_string(scratch)?,
            _scratch: scratch_file,
        })
    }

    /// Build the private root and pivot into it.
    ///
    /// Runs in the forked child after it entered a fresh mount namespace.
    pub(crate) fn apply(&self) -> io::Result<()> {
        mount(None, c"/", None, libc::MS_REC | libc::MS_PRIVATE, None)?;
        mount(
            Some(c"tmpfs"),
            &self.new_root,
            Some(c"tmpfs"),
            libc::MS_NOSUID | libc::MS_NODEV,
            Some(ROOT_TMPFS_OPTIONS),
        )?;

        for step in &self.steps {
            step.apply()?;
        }

        // SAFETY: plain syscalls on NUL-terminated strings we own
        unsafe {
            check(libc::chdir(self.new_root.as_ptr()))?;
            check(libc::syscall(libc::SYS_pivot_root, c".".as_ptr(), c".".as_ptr()) as libc::c_int)?;
            check(libc::umount2(c".".as_ptr(), libc::MNT_DETACH))?;
            check(libc::chdir(c"/".as_ptr()))?;
        }

        mount(
            None,
            c"/",
            None,
            libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV,
            None,
        )?;

        // SAFETY: as above
        check(unsafe { libc::chdir(self.workdir.as_ptr()) })
    }
}

impl Step {
    fn apply(&self) -> io::Result<()> {
        match self {
            Step::Mkdir(path) => {
                // SAFETY: NUL-terminated path we own
                if unsafe { libc::mkdir(path.as_ptr(), 0o755) } != 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::EEXIST) {
                        return Err(err);
                    }
                }
                Ok(())
            }
            Step::Touch(path) => {
                // SAFETY: as above; the descriptor is closed right away
                unsafe {
                    let fd = libc::open(
                        path.as_ptr(),
                        libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
                        0o644 as libc::c_uint,
                    );
                    check(fd)?;
                    libc::close(fd);
                }
                Ok(())
            }
            Step::Symlink { target, link } => {
                // SAFETY: as above
                check(unsafe { libc::symlink(target.as_ptr(), link.as_ptr()) })
            }
            Step::Bind {
                source,
                target,
                writable,
            } => {
                mount(Some(source.as_c_str()), target, None, libc::MS_BIND | libc::MS_REC, None)?;

                let mut flags = libc::MS_BIND | libc::MS_REMOUNT | libc::MS_NOSUID | locked_flags(target)?;
                if *writable {
                    flags |= libc::MS_NODEV;
                } else {
                    flags |= libc::MS_RDONLY;
                }
                mount(None, target, None, flags, None)
            }
        }
    }
}

/// Flags of the mount at `path` that a bind remount must repeat.
///
/// Inside a user namespace the kernel locks these on mounts inherited from
/// the host and rejects a remount that would drop them.
fn locked_flags(path: &CStr) -> io::Result<libc::c_ulong> {
    // SAFETY: statvfs is plain data; the call fills the struct we pass
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: as above
    check(unsafe { libc::statvfs(path.as_ptr(), &mut st) })?;

    let f = st.f_flag;
    let mut flags = 0;
    if f & libc::ST_NODEV != 0 {
        flags |= libc::MS_NODEV;
    }
    if f & libc::ST_NOEXEC != 0 {
        flags |= libc::MS_NOEXEC;
    }
    if f & libc::ST_NOATIME != 0 {
        flags |= libc::MS_NOATIME;
    }
    if f & libc::ST_NODIRATIME != 0 {
        flags |= libc::MS_NODIRATIME;
    }
    if f & libc::ST_RELATIME != 0 {
        flags |= libc::MS_RELATIME;
    }
    if f & (libc::ST_NOATIME | libc::ST_RELATIME) == 0 {
        flags |= libc::MS_STRICTATIME;
    }
    Ok(flags)
}

fn mount(
    source: Option<&CStr>,
    target: &CStr,
    fstype: Option<&CStr>,
    flags: libc::c_ulong,
    data: Option<&CStr>,
) -> io::Result<()> {
    // SAFETY: every pointer is either null or a NUL-terminated string we own
    check(unsafe {
        libc::mount(
            source.map_or(ptr::null(), CStr::as_ptr),
            target.as_ptr(),
            fstype.map_or(ptr::null(), CStr::as_ptr),
            flags,
            data.map_or(ptr::null(), |d| d.as_ptr().cast()),
        )
    })
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct PlanBuilder {
    root: PathBuf,
    steps: Vec<Step>,
    /// Directories already created under the new root
    created: BTreeSet<PathBuf>,
    /// Host paths already bound or linked
    exposed: Vec<PathBuf>,
}

impl PlanBuilder {
    /// Where a host path lands under the new root before the pivot
    fn inside(&self, host: &Path) -> PathBuf {
        let relative: PathBuf = host
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.root.join(relative)
    }

    fn expose(&mut self, path: &Path) -> io::Result<()> {
        if !path.is_absolute()
            || path.starts_with(&self.root)
            || self.root.starts_with(path)
            || self.exposed.iter().any(|p| path.starts_with(p))
        {
            trace!(path = %path.display(), "not exposing path");
            return Ok(());
        }

        let meta = match std::fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let target = self.inside(path);
        if meta.file_type().is_symlink() {
            self.mkdir_parents(path)?;
            self.steps.push(Step::Symlink {
                target: c_string(&std::fs::read_link(path)?)?,
                link: c_string(&target)?,
            });
        } else {
            if meta.is_dir() {
                self.mkdir_all(path)?;
            } else {
                self.mkdir_parents(path)?;
                self.steps.push(Step::Touch(c_string(&target)?));
            }
            self.steps.push(Step::Bind {
                source: c_string(path)?,
                target: c_string(&target)?,
                writable: false,
            });
        }

        self.exposed.push(path.to_path_buf());
        Ok(())
    }

    fn mkdir_parents(&mut self, path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) => self.mkdir_all(parent),
            None => Ok(()),
        }
    }

    /// Create `host` and its ancestors under the new root
    fn mkdir_all(&mut self, host: &Path) -> io::Result<()> {
        let mut current = PathBuf::from("/");
        for component in host.components() {
            if let Component::Normal(name) = component {
                current.push(name);
                let inside = self.inside(&current);
                if self.created.insert(inside.clone()) {
                    self.steps.push(Step::Mkdir(c_string(&inside)?));
                }
            }
        }
        Ok(())
    }
}

/// Expand trailing-`*` patterns against the host filesystem
fn expand_patterns(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut expanded = Vec::new();
    for path in paths {
        let pattern = path
            .file_name()
            .map(|n| n.as_bytes())
            .and_then(|n| n.strip_suffix(b"*"));
        let (Some(prefix), Some(parent)) = (pattern, path.parent()) else {
            expanded.push(path.clone());
            continue;
        };

        let Ok(entries) = std::fs::read_dir(parent) else {
            continue;
        };
        let mut matches: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_name().as_bytes().starts_with(prefix))
            .map(|e| e.path())
            .collect();
        matches.sort();
        expanded.extend(matches);
    }
    expanded
}

fn c_string(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}
