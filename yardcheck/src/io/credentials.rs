//! Discovery of usable SSH credentials.
//!
//! Two sources are considered, in order: a running agent advertised through
//! `SSH_AUTH_SOCK` (which also covers passphrase-protected keys), then private
//! key files that parse without a passphrase. Anything unusable is skipped
//! without being reported as an error.

use std::ffi::OsStr;
use std::fs;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::io::process::run_process;
use crate::io::ssh::ConnectError;

const KEY_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials the `ssh` client may offer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Reachable agent socket.
    pub agent: Option<PathBuf>,
    /// Key files that load without a passphrase.
    pub keys: Vec<PathBuf>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.agent.is_none() && self.keys.is_empty()
    }
}

/// `~/.ssh/id_ed25519` then `~/.ssh/id_rsa`.
pub fn default_key_paths() -> Vec<PathBuf> {
    dirs::home_dir()
        .map(|home| {
            let ssh = home.join(".ssh");
            vec![ssh.join("id_ed25519"), ssh.join("id_rsa")]
        })
        .unwrap_or_default()
}

/// The explicit key when one was given, otherwise the default list.
pub fn candidate_key_paths(hint: Option<&Path>) -> Vec<PathBuf> {
    match hint {
        Some(path) => vec![path.to_path_buf()],
        None => default_key_paths(),
    }
}

/// Collect every usable credential; fails only when none is found.
pub fn discover(
    agent_socket: Option<&OsStr>,
    candidates: &[PathBuf],
) -> Result<Credentials, ConnectError> {
    let agent = agent_socket
        .filter(|sock| !sock.is_empty())
        .map(PathBuf::from)
        .filter(|sock| agent_reachable(sock));

    let keys: Vec<PathBuf> = candidates
        .iter()
        .filter(|path| key_parses_unprotected(path))
        .cloned()
        .collect();

    let creds = Credentials { agent, keys };
    if creds.is_empty() {
        return Err(ConnectError::Auth(format!(
            "no agent at SSH_AUTH_SOCK and no unprotected key among {candidates:?}"
        )));
    }
    debug!(agent = creds.agent.is_some(), keys = creds.keys.len(), "credentials discovered");
    Ok(creds)
}

fn agent_reachable(socket: &Path) -> bool {
    match UnixStream::connect(socket) {
        Ok(_) => true,
        Err(e) => {
            debug!(socket = %socket.display(), err = %e, "agent socket unreachable");
            false
        }
    }
}

/// A key is usable when its public half can be derived with an empty passphrase.
fn key_parses_unprotected(path: &Path) -> bool {
    match fs::read(path) {
        Ok(data) if !data.is_empty() => {}
        Ok(_) => return false,
        Err(e) => {
            debug!(key = %path.display(), err = %e, "key unreadable, skipping");
            return false;
        }
    }
    let mut cmd = Command::new("ssh-keygen");
    cmd.arg("-y").arg("-P").arg("").arg("-f").arg(path);
    match run_process(cmd, None, Some(KEY_PROBE_TIMEOUT), 64 * 1024) {
        Ok(output) if output.success() => true,
        Ok(_) => {
            debug!(key = %path.display(), "key does not parse unprotected, skipping");
            false
        }
        Err(e) => {
            debug!(key = %path.display(), err = %e, "key probe failed, skipping");
            false
        }
    }
}
