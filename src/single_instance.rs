use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};

use crate::errors::{AppError, AppResult};

const LOCK_FILE_NAME: &str = "image_dispatch.lock";

/// PID lock file held for the lifetime of a dispatch. Removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Default lock location: the user runtime directory, or the temp dir.
    pub fn default_path() -> PathBuf {
        dirs::runtime_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(LOCK_FILE_NAME)
    }

    /// Fails with `AlreadyRunning` while another live dispatch holds the
    /// lock. Locks left behind by dead processes are replaced.
    pub fn acquire(path: &Path) -> AppResult<Self> {
        if path.exists() {
            if let Some(pid) = read_pid(path) {
                if is_dispatch_running(pid) {
                    return Err(AppError::AlreadyRunning { pid });
                }
            }

            log::info!("Removing stale lock file {}", path.display());
            let _ = fs::remove_file(path);
        }

        let current_pid = std::process::id();
        create_lock_file(path, current_pid)?;
        log::info!("Created lock file {} with PID: {}", path.display(), current_pid);

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to remove lock file {}: {}", self.path.display(), e);
        } else {
            log::debug!("Cleaned up lock file {}", self.path.display());
        }
    }
}

/// Creates the lock only if no other run created it in the meantime.
fn create_lock_file(path: &Path, pid: u32) -> AppResult<()> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(AppError::AlreadyRunning {
                pid: read_pid(path).unwrap_or(0),
            });
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(pid.to_string().as_bytes())?;
    Ok(())
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse::<u32>().ok()
}

fn is_dispatch_running(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes();

    match system.process(Pid::from(pid as usize)) {
        // the PID may have been recycled by an unrelated program
        Some(process) => process.name().to_lowercase().contains("dispatch"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_created_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.lock");

        {
            let lock = InstanceLock::acquire(&path).unwrap();
            assert_eq!(lock.path(), path.as_path());
            assert_eq!(
                fs::read_to_string(&path).unwrap(),
                std::process::id().to_string()
            );
        }

        assert!(!path.exists());
    }

    #[test]
    fn stale_locks_are_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.lock");
        fs::write(&path, "not-a-pid").unwrap();

        let _lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn lock_created_by_a_concurrent_run_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.lock");
        fs::write(&path, "4242").unwrap();

        match create_lock_file(&path, std::process::id()) {
            Err(AppError::AlreadyRunning { pid }) => assert_eq!(pid, 4242),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "4242");
    }

    #[test]
    fn live_dispatch_blocks_a_second_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.lock");

        // the unit test binary is named image_dispatch-<hash>
        let _first = InstanceLock::acquire(&path).unwrap();
        match InstanceLock::acquire(&path) {
            Err(AppError::AlreadyRunning { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
