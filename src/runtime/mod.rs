//! Isolated execution
//!
//! Creates the jail root and runs the target command confined to it,
//! inside its own PID namespace.

pub mod jail;
pub mod process;
pub mod syscall;

pub use jail::JailRoot;
pub use process::{exit_code, IsolatedLauncher, ProcessState};

use syscall::clone_flags;

/// Isolation settings for the launched command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Start the command as PID 1 of a new PID namespace
    pub pid_namespace: bool,
    /// Make the jail root the command's `/`
    pub chroot: bool,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            pid_namespace: true,
            chroot: true,
        }
    }
}

impl LaunchConfig {
    /// No isolation at all; the command runs like a plain child process
    pub fn unisolated() -> Self {
        Self {
            pid_namespace: false,
            chroot: false,
        }
    }

    /// Namespace flags passed to `unshare` before spawning
    pub fn namespace_flags(&self) -> i32 {
        if self.pid_namespace {
            clone_flags::CLONE_NEWPID
        } else {
            0
        }
    }
}
