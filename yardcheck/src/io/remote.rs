//! Executor abstraction over an established remote channel.
//!
//! The [`Remote`] trait decouples the verification suite from the actual
//! transport (an SSH ControlMaster connection in production). Tests use
//! scripted or simulated remotes that never open a socket.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::commands::{flatten_remote_name, upload_pipeline};
use crate::io::ssh::ConnectError;

/// Exit code reported when a sub-session could not be opened at all.
pub const SESSION_FAILED_EXIT: i32 = 255;

/// Captured result of one remote command.
///
/// A non-zero `exit_code` is a normal, inspectable result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Sentinel result for a sub-session that never started.
    pub fn session_failed(error: impl std::fmt::Display) -> Self {
        Self {
            stdout: String::new(),
            stderr: error.to_string(),
            exit_code: SESSION_FAILED_EXIT,
        }
    }

    /// stdout followed by stderr, for failure messages.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// An authenticated channel able to run independent commands concurrently.
///
/// Each call opens its own sub-session; implementations must not share
/// buffers between concurrent calls.
pub trait Remote: Sync {
    /// Run `command` in the remote shell, feeding `stdin` when given.
    fn exec(&self, command: &str, stdin: Option<&[u8]>) -> RemoteOutput;

    fn run(&self, command: &str) -> RemoteOutput {
        self.exec(command, None)
    }
}

/// Establishes channels and re-establishes them after the host restarts.
pub trait Connect {
    type Channel: Remote;

    fn connect(&self) -> Result<Self::Channel, ConnectError>;

    /// Close `channel`, wait up to `max_wait` for the host to accept
    /// connections again and replace `channel` with a fresh one.
    fn reconnect(
        &self,
        channel: &mut Self::Channel,
        max_wait: Duration,
    ) -> Result<(), ConnectError>;
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("remote name {0:?} has no file component")]
    BadName(String),
    #[error("write ~/{name} failed (exit {exit_code}): {stderr}")]
    Remote {
        name: String,
        exit_code: i32,
        stderr: String,
    },
}

/// Copy a local file to `~/<basename(remote_name_hint)>` and mark it executable.
///
/// Directory components of `remote_name_hint` are discarded: the file always
/// lands directly in the remote home directory. Returns the base name used.
#[instrument(skip(remote, local), fields(local = %local.display()))]
pub fn upload<R: Remote + ?Sized>(
    remote: &R,
    local: &Path,
    remote_name_hint: &str,
) -> Result<String, UploadError> {
    let data = fs::read(local).map_err(|source| UploadError::Read {
        path: local.to_path_buf(),
        source,
    })?;
    let name = flatten_remote_name(remote_name_hint)
        .ok_or_else(|| UploadError::BadName(remote_name_hint.to_string()))?;
    if remote_name_hint.trim_start_matches("~/") != name {
        debug!(requested = remote_name_hint, landed = %name, "upload flattened to home directory");
    }

    let output = remote.exec(&upload_pipeline(&name), Some(&data));
    if !output.success() {
        warn!(exit_code = output.exit_code, "upload failed");
        return Err(UploadError::Remote {
            name,
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    info!(bytes = data.len(), name = %name, "uploaded");
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeRemote, failed};

    #[test]
    fn nested_destination_lands_in_home() {
        let temp = tempfile::tempdir().expect("tempdir");
        let local = temp.path().join("tool.sh");
        fs::write(&local, b"#!/bin/sh\necho hi\n").expect("write");
        let remote = FakeRemote::succeeding();

        let name = upload(&remote, &local, "level1/level2/name").expect("upload");

        assert_eq!(name, "name");
        let calls = remote.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "cat > ~/'name' && chmod +x ~/'name'");
        assert_eq!(calls[0].stdin.as_deref(), Some(&b"#!/bin/sh\necho hi\n"[..]));
    }

    #[test]
    fn unreadable_local_file_never_touches_remote() {
        let temp = tempfile::tempdir().expect("tempdir");
        let remote = FakeRemote::succeeding();
        let err = upload(&remote, &temp.path().join("missing.sh"), "~/x.sh").unwrap_err();
        assert!(matches!(err, UploadError::Read { .. }));
        assert!(remote.calls().is_empty());
    }

    #[test]
    fn remote_write_failure_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let local = temp.path().join("tool.sh");
        fs::write(&local, b"x").expect("write");
        let remote = FakeRemote::new(|_| failed(1, "disk full\n"));
        let err = upload(&remote, &local, "~/tool.sh").unwrap_err();
        assert_eq!(err.to_string(), "write ~/tool.sh failed (exit 1): disk full");
    }

    #[test]
    fn session_failure_is_sentinel() {
        let output = RemoteOutput::session_failed("control socket gone");
        assert_eq!(output.exit_code, SESSION_FAILED_EXIT);
        assert_eq!(output.stderr, "control socket gone");
        assert!(!output.success());
    }
}
