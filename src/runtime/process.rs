//! Isolated process execution
//!
//! Runs one command with the jail root as its `/` and, by default, as PID 1
//! of a fresh PID namespace. Standard streams are inherited.

use super::syscall;
use super::LaunchConfig;
use crate::error::{JailError, Result};
use std::ffi::CString;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;

/// Exit code reported when a child ends neither by exit nor by signal
pub const ABNORMAL_EXIT_CODE: i32 = 1;

/// Launcher state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Nothing spawned yet
    NotStarted,
    /// Child is running with the given host PID
    Running(u32),
    /// Child has exited with the given code
    Exited(i32),
}

/// Map a child's exit status to the code this process should exit with
///
/// A signal `N` maps to `128 + N`, the shell convention.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(signal) = status.signal() {
        128 + signal
    } else {
        ABNORMAL_EXIT_CODE
    }
}

/// Launches a single command inside a jail root
pub struct IsolatedLauncher {
    /// Root filesystem path
    root: PathBuf,
    /// Isolation settings
    config: LaunchConfig,
    /// Current state
    state: ProcessState,
}

impl IsolatedLauncher {
    pub fn new(root: impl Into<PathBuf>, config: LaunchConfig) -> Self {
        Self {
            root: root.into(),
            config,
            state: ProcessState::NotStarted,
        }
    }

    /// Get the current state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Run `command` with `args` and wait for it
    ///
    /// Returns the child's exit code. Any failure to set up or start the
    /// child is a [`JailError::Launch`]; a launcher runs at most once.
    pub async fn run(&mut self, command: &str, args: &[String]) -> Result<i32> {
        if self.state != ProcessState::NotStarted {
            return Err(JailError::Launch(format!(
                "launcher already used ({:?})",
                self.state
            )));
        }

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        if self.config.chroot {
            if !self.root.is_dir() {
                return Err(JailError::Launch(format!(
                    "jail root {} is not a directory",
                    self.root.display()
                )));
            }
            let root = syscall::path_cstring(&self.root)
                .map_err(|e| JailError::Launch(format!("jail root: {}", e)))?;
            let slash = CString::new("/").map_err(|e| JailError::Launch(e.to_string()))?;
            // Runs in the forked child before exec; only async-signal-safe calls.
            unsafe {
                cmd.pre_exec(move || {
                    syscall::chroot(&root)?;
                    syscall::chdir(&slash)
                });
            }
        }

        let flags = self.config.namespace_flags();
        if flags != 0 {
            syscall::unshare(flags).map_err(|e| {
                JailError::Launch(format!("failed to create PID namespace: {}", e))
            })?;
        }

        let mut child = cmd.spawn().map_err(|e| {
            JailError::Launch(format!(
                "failed to start '{}' in {}: {}",
                command,
                self.root.display(),
                e
            ))
        })?;

        let pid = child.id().unwrap_or_default();
        self.state = ProcessState::Running(pid);
        tracing::info!(pid, "Started '{}' with {} args", command, args.len());

        let status = child
            .wait()
            .await
            .map_err(|e| JailError::Launch(format!("failed to wait for '{}': {}", command, e)))?;

        let code = exit_code(status);
        self.state = ProcessState::Exited(code);
        tracing::info!(pid, code, "Isolated process exited");
        Ok(code)
    }
}
