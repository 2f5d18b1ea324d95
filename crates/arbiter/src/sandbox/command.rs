//! Command builder for sandboxed processes
//!
//! Collects the program, environment and limits of one execution and turns
//! them into a `tokio::process::Command` that isolates itself before exec.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::config::DEFAULT_SANDBOX_PATH;
use crate::sandbox::isolation::ChildSetup;
use crate::sandbox::{IsolationOptions, RlimitPlan, SandboxError, resolve_command};
use crate::types::ResourceLimits;

/// Builder for a sandboxed process
#[derive(Debug, Clone)]
pub struct SandboxCommand {
    /// Program and arguments
    command: Vec<String>,
    /// Environment on top of the minimal sandbox environment
    env: HashMap<String, String>,
    /// PATH inside the sandbox, also used to resolve the program
    search_path: String,
    /// Resource limits
    limits: ResourceLimits,
    /// Cap the address space at the memory limit
    address_space_limit: bool,
    isolation: IsolationOptions,
}

impl SandboxCommand {
    /// Create a new builder for the given program and arguments
    pub fn new(command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            env: HashMap::new(),
            search_path: DEFAULT_SANDBOX_PATH.to_owned(),
            limits: ResourceLimits::default(),
            address_space_limit: true,
            isolation: IsolationOptions::none(),
        }
    }

    /// Set resource limits
    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set several environment variables
    pub fn envs<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the PATH used inside the sandbox
    pub fn search_path(mut self, path: impl Into<String>) -> Self {
        self.search_path = path.into();
        self
    }

    /// Enable or disable the RLIMIT_AS memory cap
    pub fn address_space_limit(mut self, enable: bool) -> Self {
        self.address_space_limit = enable;
        self
    }

    /// Set process isolation
    pub fn isolation(mut self, isolation: IsolationOptions) -> Self {
        self.isolation = isolation;
        self
    }

    /// Get the resource limits
    pub fn get_limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Get the program and arguments
    pub fn program(&self) -> &[String] {
        &self.command
    }

    /// The rlimits the child will apply
    pub fn rlimit_plan(&self) -> RlimitPlan {
        RlimitPlan::from_limits(&self.limits, self.address_space_limit)
    }

    /// Build the process command running in `working_dir`.
    ///
    /// The environment is cleared down to `PATH`, `HOME`, `TMPDIR` and the
    /// configured variables. The child leads its own process group, which
    /// the limiter kills as a unit.
    pub(crate) fn build(
        self,
        working_dir: &Path,
        cgroup_procs: Option<RawFd>,
    ) -> Result<Command, SandboxError> {
        let mut argv = self.command.clone();
        resolve_command(&mut argv, &self.search_path)?;
        let setup = ChildSetup::new(
            self.isolation.clone(),
            self.rlimit_plan(),
            cgroup_procs,
            working_dir,
        )?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(working_dir)
            .env_clear()
            .env("PATH", &self.search_path)
            .env("HOME", working_dir)
            .env("TMPDIR", working_dir)
            .env("LANG", "C.UTF-8")
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        // SAFETY: ChildSetup::apply only issues async-signal-safe syscalls
        unsafe {
            cmd.pre_exec(move || setup.apply());
        }

        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_settings() {
        let cmd = SandboxCommand::new(["python3", "-B", "main.py"])
            .env("PYTHONIOENCODING", "utf-8")
            .envs([("A", "1"), ("B", "2")])
            .search_path("/usr/bin:/bin")
            .limits(ResourceLimits::unset().with_memory_limit_mb(64));

        assert_eq!(cmd.program(), ["python3", "-B", "main.py"]);
        assert_eq!(cmd.env.len(), 3);
        assert_eq!(cmd.search_path, "/usr/bin:/bin");
        assert_eq!(cmd.get_limits().memory_limit_mb, Some(64));
    }

    #[test]
    fn rlimit_plan_follows_address_space_flag() {
        let limits = ResourceLimits::default();
        let capped = SandboxCommand::new(["./main"]).limits(limits.clone());
        assert!(capped.rlimit_plan().address_space.is_some());

        let uncapped = SandboxCommand::new(["java", "Main"])
            .limits(limits)
            .address_space_limit(false);
        assert!(uncapped.rlimit_plan().address_space.is_none());
    }

    #[test]
    fn rlimit_plan_caps_processes() {
        let cmd = SandboxCommand::new(["./main"]).limits(ResourceLimits::default());
        assert_eq!(cmd.rlimit_plan().processes, Some(16));

        let cmd = cmd.limits(ResourceLimits::unset());
        assert!(cmd.rlimit_plan().processes.is_none());
    }

    #[test]
    fn build_fails_for_missing_scratch_when_confined() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = SandboxCommand::new(["sh", "-c", "true"]).isolation(IsolationOptions {
            confine_filesystem: true,
            ..IsolationOptions::none()
        });
        assert!(matches!(
            cmd.build(&dir.path().join("gone"), None),
            Err(SandboxError::Io(_))
        ));
    }

    #[test]
    fn build_rejects_unknown_program() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = SandboxCommand::new(["no-such-interpreter-xyz", "main.x"]);
        assert!(matches!(
            cmd.build(dir.path(), None),
            Err(SandboxError::CommandNotFound(_))
        ));
    }

    #[test]
    fn build_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = SandboxCommand::new(Vec::<String>::new());
        assert!(matches!(
            cmd.build(dir.path(), None),
            Err(SandboxError::EmptyCommand)
        ));
    }
}
