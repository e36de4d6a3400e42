//! Per-attempt materialization of the script body on disk.

use std::{io::Write, path::Path};

use anyhow::{Context, Result};
use tempfile::{Builder, TempPath};

/// An executable copy of the script, removed when dropped.
///
/// Each attempt materializes a fresh copy; nothing carries over between
/// attempts.
#[derive(Debug)]
pub struct MaterializedScript {
    path: TempPath,
}

impl MaterializedScript {
    /// Write `source` verbatim into a uniquely named file under the system
    /// temp directory and make it executable by the owner.
    pub fn create(source: &str) -> Result<Self> {
        Self::create_in(&std::env::temp_dir(), source)
    }

    pub fn create_in(dir: &Path, source: &str) -> Result<Self> {
        let mut file = Builder::new()
            .prefix("overlay-script-")
            .suffix(".sh")
            .tempfile_in(dir)
            .with_context(|| format!("creating script file in {}", dir.display()))?;

        file.write_all(source.as_bytes())
            .context("writing script body")?;
        file.flush().context("flushing script body")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o700))
                .context("marking script executable")?;
        }

        // Close the write handle so the interpreter never sees a file that is
        // still open for writing.
        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
