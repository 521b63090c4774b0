//! Platform paths and helper-process bookkeeping.
//!
//! A [`Platform`] value is constructed once and passed into whatever needs
//! it (helper run loop, CLI commands, tests) — there is no process-wide
//! singleton, so tests inject a `TempDir`-backed instance.
//!
//! # File Layout
//!
//! ```text
//! {config_dir}/agenthub/
//!   config.json          # user configuration
//!
//! /tmp/agenthub-{uid}/     (POSIX)
//!   helper.sock          # Unix domain socket for IPC
//!   helper.pid           # PID of the running helper process
//! ```
//!
//! Sockets live in `/tmp` because macOS limits Unix socket paths to 104
//! bytes, and platform config directories routinely exceed that.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Resolved directories and runtime file paths for this machine.
#[derive(Debug, Clone)]
pub struct Platform {
    config_dir: PathBuf,
    runtime_dir: PathBuf,
}

impl Platform {
    /// Resolve the standard platform directories.
    ///
    /// `AGENTHUB_CONFIG_DIR` and `AGENTHUB_RUNTIME_DIR` override the
    /// defaults (used by integration tests and packaging).
    pub fn new() -> Result<Self> {
        let config_dir = match std::env::var("AGENTHUB_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("agenthub"),
        };
        let runtime_dir = match std::env::var("AGENTHUB_RUNTIME_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_runtime_dir(&config_dir),
        };
        Ok(Self {
            config_dir,
            runtime_dir,
        })
    }

    /// Build a platform rooted at explicit directories (tests).
    pub fn with_dirs(config_dir: impl Into<PathBuf>, runtime_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            runtime_dir: runtime_dir.into(),
        }
    }

    /// Configuration directory.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Create the config and runtime directories, restricting the runtime
    /// directory to the owner.
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.config_dir)
            .with_context(|| format!("Failed to create {}", self.config_dir.display()))?;
        fs::create_dir_all(&self.runtime_dir)
            .with_context(|| format!("Failed to create {}", self.runtime_dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.runtime_dir, fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    /// IPC address of the helper.
    pub fn socket_address(&self) -> String {
        #[cfg(unix)]
        {
            self.runtime_dir
                .join("helper.sock")
                .to_string_lossy()
                .into_owned()
        }
        #[cfg(windows)]
        {
            r"\\.\pipe\agenthub-helper".to_string()
        }
    }

    /// Path of the helper's pid file.
    pub fn pid_file_path(&self) -> PathBuf {
        self.runtime_dir.join("helper.pid")
    }

    /// Record the current process as the running helper.
    pub fn write_pid_file(&self) -> Result<()> {
        let path = self.pid_file_path();
        let pid = std::process::id();
        fs::write(&path, pid.to_string())
            .with_context(|| format!("Failed to write pid file: {}", path.display()))?;
        log::info!("Wrote pid file: {} (pid={pid})", path.display());
        Ok(())
    }

    /// Read the recorded helper pid, if any.
    pub fn read_pid_file(&self) -> Option<u32> {
        let contents = fs::read_to_string(self.pid_file_path()).ok()?;
        contents.trim().parse().ok()
    }

    /// Whether a helper process recorded in the pid file is still alive.
    pub fn is_helper_running(&self) -> bool {
        let Some(pid) = self.read_pid_file() else {
            return false;
        };
        process_alive(pid)
    }

    /// Remove pid and socket files. Safe when they do not exist.
    pub fn remove_runtime_files(&self) {
        let _ = fs::remove_file(self.pid_file_path());
        #[cfg(unix)]
        {
            let _ = fs::remove_file(self.socket_address());
        }
        log::debug!("Removed helper runtime files");
    }
}

#[cfg(unix)]
fn default_runtime_dir(_config_dir: &Path) -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/tmp/agenthub-{uid}"))
}

#[cfg(windows)]
fn default_runtime_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("runtime")
}

/// Check liveness without signaling (`kill(pid, 0)`).
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
fn process_alive(_pid: u32) -> bool {
    // Pid probing needs OpenProcess; the pid file alone is good enough for
    // the CLI's "is it running" hint on Windows.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_platform(tmp: &tempfile::TempDir) -> Platform {
        Platform::with_dirs(tmp.path().join("config"), tmp.path().join("runtime"))
    }

    #[test]
    fn test_socket_address_is_under_runtime_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let platform = temp_platform(&tmp);
        let address = platform.socket_address();
        assert!(address.ends_with("helper.sock"), "got: {address}");
    }

    #[test]
    fn test_pid_file_write_read_cleanup_cycle() {
        let tmp = tempfile::TempDir::new().unwrap();
        let platform = temp_platform(&tmp);
        platform.ensure_dirs().unwrap();

        platform.write_pid_file().unwrap();
        assert_eq!(platform.read_pid_file(), Some(std::process::id()));
        assert!(platform.is_helper_running());

        platform.remove_runtime_files();
        assert!(platform.read_pid_file().is_none());
        assert!(!platform.is_helper_running());
    }

    #[test]
    fn test_read_nonexistent_pid_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let platform = temp_platform(&tmp);
        assert!(platform.read_pid_file().is_none());
        assert!(!platform.is_helper_running());
    }

    #[test]
    fn test_garbage_pid_file_is_ignored() {
        let tmp = tempfile::TempDir::new().unwrap();
        let platform = temp_platform(&tmp);
        platform.ensure_dirs().unwrap();
        fs::write(platform.pid_file_path(), "not a pid").unwrap();
        assert!(platform.read_pid_file().is_none());
    }
}
