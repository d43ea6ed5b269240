//! Ephemeral root directory for the isolated process

use crate::error::Result;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::TempDir;

/// Name prefix of every jail directory
pub const JAIL_PREFIX: &str = "runejail-";

/// A freshly created, uniquely named root directory
///
/// The directory and everything unpacked into it are removed when the
/// value is dropped or [`JailRoot::close`]d.
#[derive(Debug)]
pub struct JailRoot {
    dir: TempDir,
}

impl JailRoot {
    /// Create a jail root under the system temporary directory
    pub fn create() -> Result<Self> {
        Self::create_in(std::env::temp_dir())
    }

    /// Create a jail root under `parent`
    pub fn create_in(parent: impl AsRef<Path>) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(JAIL_PREFIX)
            .tempdir_in(parent)?;
        // Image roots are world-readable like a real `/`
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o755))?;

        tracing::info!("Created jail root {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the jail root, reporting any failure
    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        tracing::debug!("Removed jail root {}", path.display());
        Ok(())
    }
}
