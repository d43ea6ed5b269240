//! Raw system call wrappers for Linux
//!
//! Thin `libc` wrappers returning `io::Result`. The path-taking calls accept
//! already converted C strings so they can run between fork and exec
//! without allocating.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Clone flags for namespace creation
pub mod clone_flags {
    /// Create new PID namespace
    pub const CLONE_NEWPID: i32 = 0x20000000;
}

/// Result type for syscall operations
pub type SyscallResult<T> = std::result::Result<T, io::Error>;

fn check(result: libc::c_int) -> SyscallResult<()> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Convert a path for use with the calls below
pub fn path_cstring(path: &Path) -> SyscallResult<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

/// Perform unshare syscall to create new namespaces
///
/// With `CLONE_NEWPID` the caller stays where it is; its next child becomes
/// PID 1 of the new namespace.
pub fn unshare(flags: i32) -> SyscallResult<()> {
    check(unsafe { libc::unshare(flags) })
}

/// Change root directory
pub fn chroot(path: &CStr) -> SyscallResult<()> {
    check(unsafe { libc::chroot(path.as_ptr()) })
}

/// Change current directory
pub fn chdir(path: &CStr) -> SyscallResult<()> {
    check(unsafe { libc::chdir(path.as_ptr()) })
}

/// Effective user ID of the current process
pub fn geteuid() -> u32 {
    unsafe { libc::geteuid() }
}
