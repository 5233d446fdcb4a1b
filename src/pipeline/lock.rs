//! One build per workspace.
//!
//! The lock file sits next to the workspace, not inside it, because
//! `clean all` removes the workspace directory itself. The lock is an
//! advisory `flock`, so the kernel releases it when the process dies.

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::BuildError;

/// Holds an exclusive lock on a workspace until dropped.
pub struct BuildLock {
    _file: Flock<File>,
    path: PathBuf,
}

/// `<parent>/.<name>.lock` for a workspace at `<parent>/<name>`.
pub fn lock_path(workspace: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(workspace.file_name().unwrap_or_else(|| OsStr::new("workspace")));
    name.push(".lock");
    workspace.with_file_name(name)
}

impl BuildLock {
    pub fn acquire(workspace: &Path) -> Result<Self> {
        let path = lock_path(workspace);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        let locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(BuildError::resource(format!(
                    "another build is using workspace {} (lock {})",
                    workspace.display(),
                    path.display()
                ))
                .into());
            }
            Err((_, errno)) => {
                return Err(anyhow::Error::new(errno))
                    .with_context(|| format!("Failed to lock {}", path.display()));
            }
        };

        let mut holder: &File = &locked;
        holder.set_len(0)?;
        writeln!(holder, "{}", std::process::id())?;

        tracing::debug!(lock_path = %path.display(), "Acquired build lock");
        Ok(Self {
            _file: locked,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        tracing::debug!(lock_path = %self.path.display(), "Released build lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    #[test]
    fn test_lock_path_is_beside_workspace() {
        assert_eq!(
            lock_path(Path::new("/work/build")),
            PathBuf::from("/work/.build.lock")
        );
    }

    #[test]
    fn test_second_lock_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("build");

        let first = BuildLock::acquire(&ws).unwrap();
        let err = BuildLock::acquire(&ws).err().unwrap();
        assert_eq!(classify(&err).map(|e| e.kind()), Some("ResourceError"));

        drop(first);
        assert!(BuildLock::acquire(&ws).is_ok());
    }
}
