//! SSH connection manager and multiplexed command channel.
//!
//! A channel is an OpenSSH ControlMaster connection whose control socket lives
//! in a private temporary directory. Every command spawns its own `ssh` client
//! over that socket, so concurrent commands get independent sub-sessions with
//! their own pipes while sharing one authenticated connection.

use std::env;
use std::fs;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::io::config::{HarnessConfig, HostKeyPolicy};
use crate::io::credentials::{Credentials, candidate_key_paths, discover};
use crate::io::poll::{PollTimeout, RetryBudget, poll_until};
use crate::io::process::{DEFAULT_OUTPUT_LIMIT_BYTES, run_process};
use crate::io::remote::{Connect, Remote, RemoteOutput, SESSION_FAILED_EXIT};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Extra time granted to the master process beyond its own connect timeout.
const MASTER_GRACE: Duration = Duration::from_secs(30);
/// Keepalive cadence; a peer silent for `interval * count` seconds is dropped.
const SERVER_ALIVE_INTERVAL_SECS: u64 = 15;
const SERVER_ALIVE_COUNT_MAX: u32 = 3;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("host did not become reachable")]
    Timeout(#[from] PollTimeout),
}

/// Remote endpoint of the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Establishes and re-establishes the authenticated channel.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    target: SshTarget,
    key_hint: Option<PathBuf>,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
    connect_timeout: Duration,
    reachability_interval: Duration,
}

impl ConnectionManager {
    pub fn new(target: SshTarget, key_hint: Option<PathBuf>, cfg: &HarnessConfig) -> Self {
        Self {
            target,
            key_hint,
            policy: cfg.host_key_policy,
            known_hosts: cfg.known_hosts.clone(),
            connect_timeout: cfg.connect_timeout(),
            reachability_interval: cfg.reachability_interval(),
        }
    }

    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    /// Discover credentials and start a master connection.
    #[instrument(skip(self), fields(destination = %self.target.destination(), port = self.target.port))]
    pub fn establish(&self) -> Result<SshChannel, ConnectError> {
        let agent_socket = env::var_os("SSH_AUTH_SOCK");
        let creds = discover(
            agent_socket.as_deref(),
            &candidate_key_paths(self.key_hint.as_deref()),
        )?;
        let options = client_options(
            self.target.port,
            &creds,
            self.policy,
            self.known_hosts.as_deref(),
            self.connect_timeout,
        );

        let control_dir = tempfile::Builder::new()
            .prefix("yardcheck-")
            .tempdir()
            .map_err(|e| ConnectError::Transport(format!("create control dir: {e}")))?;
        let control_path = control_dir.path().join("master");
        let log_path = control_dir.path().join("master.log");

        let mut cmd = Command::new("ssh");
        cmd.args(&options)
            .arg("-o")
            .arg("ControlMaster=yes")
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg("ControlPersist=yes")
            // Diagnostics go to a file: a backgrounded master must not hold our pipes.
            .arg("-E")
            .arg(&log_path)
            .arg(self.target.destination())
            .arg("true");

        let output = run_process(
            cmd,
            None,
            Some(self.connect_timeout + MASTER_GRACE),
            DEFAULT_OUTPUT_LIMIT_BYTES,
        )
        .map_err(|e| ConnectError::Transport(format!("{e:#}")))?;

        if !output.success() {
            let log = fs::read_to_string(&log_path).unwrap_or_default();
            let detail = format!("{}{}", output.stderr_lossy(), log);
            let err = classify_failure(detail.trim(), output.code, output.timed_out);
            warn!(err = %err, "master connection failed");
            return Err(err);
        }

        info!("channel established");
        Ok(SshChannel {
            destination: self.target.destination(),
            options,
            control_path,
            _control_dir: control_dir,
            closed: false,
        })
    }

    /// Block until the command port accepts TCP connections or `max_wait` elapses.
    #[instrument(skip(self), fields(host = %self.target.host, port = self.target.port))]
    pub fn await_port(&self, max_wait: Duration) -> Result<(), ConnectError> {
        let budget = RetryBudget::Deadline {
            within: max_wait,
            interval: self.reachability_interval,
        };
        let attempts = poll_until(budget, || port_reachable(&self.target, DIAL_TIMEOUT))?;
        debug!(attempts, "command port reachable");
        Ok(())
    }
}

impl Connect for ConnectionManager {
    type Channel = SshChannel;

    fn connect(&self) -> Result<SshChannel, ConnectError> {
        self.establish()
    }

    fn reconnect(&self, channel: &mut SshChannel, max_wait: Duration) -> Result<(), ConnectError> {
        channel.close();
        self.await_port(max_wait)?;
        *channel = self.establish()?;
        Ok(())
    }
}

/// Options shared by the master and every sub-session.
///
/// The connect timeout and keepalives also bound a sub-session that falls
/// back to dialing the host itself after the master is gone.
pub fn client_options(
    port: u16,
    creds: &Credentials,
    policy: HostKeyPolicy,
    known_hosts: Option<&Path>,
    connect_timeout: Duration,
) -> Vec<String> {
    let mut options = vec![
        "-p".to_string(),
        port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        format!("ServerAliveInterval={SERVER_ALIVE_INTERVAL_SECS}"),
        "-o".to_string(),
        format!("ServerAliveCountMax={SERVER_ALIVE_COUNT_MAX}"),
    ];
    options.extend(trust_options(policy, known_hosts));
    for key in &creds.keys {
        options.push("-i".to_string());
        options.push(key.display().to_string());
    }
    if creds.agent.is_none() {
        options.push("-o".to_string());
        options.push("IdentitiesOnly=yes".to_string());
    }
    options
}

/// Host identity verification options for `policy`.
pub fn trust_options(policy: HostKeyPolicy, known_hosts: Option<&Path>) -> Vec<String> {
    let pairs: Vec<String> = match (policy, known_hosts) {
        (HostKeyPolicy::Pin, Some(pinned)) => vec![
            "StrictHostKeyChecking=yes".to_string(),
            format!("UserKnownHostsFile={}", pinned.display()),
            "GlobalKnownHostsFile=/dev/null".to_string(),
        ],
        (HostKeyPolicy::Pin, None) => {
            warn!("pin policy without a pinned file, falling back to strict");
            vec!["StrictHostKeyChecking=yes".to_string()]
        }
        (HostKeyPolicy::Strict, _) => vec!["StrictHostKeyChecking=yes".to_string()],
        (HostKeyPolicy::Disabled, _) => vec![
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
        ],
    };
    pairs
        .into_iter()
        .flat_map(|pair| ["-o".to_string(), pair])
        .collect()
}

/// Map a failed master start to the error taxonomy.
pub fn classify_failure(detail: &str, code: Option<i32>, timed_out: bool) -> ConnectError {
    if timed_out {
        return ConnectError::Transport(format!("ssh did not finish connecting: {detail}"));
    }
    if detail.contains("Permission denied") {
        return ConnectError::Auth(detail.to_string());
    }
    if detail.is_empty() {
        return ConnectError::Transport(format!("ssh exited with {code:?}"));
    }
    ConnectError::Transport(detail.to_string())
}

/// True when any resolved address of `target` accepts a TCP connection.
pub fn port_reachable(target: &SshTarget, dial_timeout: Duration) -> bool {
    let addrs = match (target.host.as_str(), target.port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!(host = %target.host, err = %e, "address resolution failed");
            return false;
        }
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, dial_timeout).is_ok())
}

/// An established, multiplexed SSH channel.
#[derive(Debug)]
pub struct SshChannel {
    destination: String,
    options: Vec<String>,
    control_path: PathBuf,
    _control_dir: TempDir,
    closed: bool,
}

impl SshChannel {
    fn session_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(&self.options)
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg(&self.destination);
        cmd
    }

    /// Stop the master connection. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-O")
            .arg("exit")
            .arg(&self.destination);
        match run_process(cmd, None, Some(DIAL_TIMEOUT), DEFAULT_OUTPUT_LIMIT_BYTES) {
            Ok(output) if output.success() => debug!("master connection closed"),
            Ok(output) => debug!(stderr = %output.stderr_lossy().trim(), "master already gone"),
            Err(e) => debug!(err = %e, "failed to signal master"),
        }
    }
}

impl Remote for SshChannel {
    fn exec(&self, command: &str, stdin: Option<&[u8]>) -> RemoteOutput {
        let mut cmd = self.session_command();
        cmd.arg(command);
        match run_process(cmd, stdin, None, DEFAULT_OUTPUT_LIMIT_BYTES) {
            Ok(output) => RemoteOutput {
                stdout: output.stdout_lossy(),
                stderr: output.stderr_lossy(),
                exit_code: output.code.unwrap_or(SESSION_FAILED_EXIT),
            },
            Err(e) => RemoteOutput::session_failed(format!("{e:#}")),
        }
    }
}

impl Drop for SshChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn creds(agent: bool, keys: &[&str]) -> Credentials {
        Credentials {
            agent: agent.then(|| PathBuf::from("/run/agent.sock")),
            keys: keys.iter().map(PathBuf::from).collect(),
        }
    }

    #[test]
    fn trust_policies_map_to_client_options() {
        assert_eq!(
            trust_options(HostKeyPolicy::Strict, None),
            vec!["-o", "StrictHostKeyChecking=yes"]
        );
        assert_eq!(
            trust_options(HostKeyPolicy::Pin, Some(Path::new("/etc/lab_hosts"))),
            vec![
                "-o",
                "StrictHostKeyChecking=yes",
                "-o",
                "UserKnownHostsFile=/etc/lab_hosts",
                "-o",
                "GlobalKnownHostsFile=/dev/null"
            ]
        );
        let disabled = trust_options(HostKeyPolicy::Disabled, None);
        assert!(disabled.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(disabled.contains(&"UserKnownHostsFile=/dev/null".to_string()));
    }

    const TIMEOUT: Duration = Duration::from_secs(15);

    #[test]
    fn keys_only_pin_identities_without_agent() {
        let keys = creds(false, &["/k/id_ed25519"]);
        let options = client_options(2222, &keys, HostKeyPolicy::Strict, None, TIMEOUT);
        assert_eq!(&options[..2], &["-p", "2222"]);
        assert!(options.windows(2).any(|w| w == ["-i", "/k/id_ed25519"]));
        assert!(options.contains(&"IdentitiesOnly=yes".to_string()));

        let options = client_options(22, &creds(true, &[]), HostKeyPolicy::Strict, None, TIMEOUT);
        assert!(!options.contains(&"IdentitiesOnly=yes".to_string()));
    }

    #[test]
    fn every_client_is_bounded_by_timeouts_and_keepalives() {
        let options = client_options(22, &creds(true, &[]), HostKeyPolicy::Strict, None, TIMEOUT);
        for setting in [
            "ConnectTimeout=15",
            "ServerAliveInterval=15",
            "ServerAliveCountMax=3",
        ] {
            assert!(
                options.windows(2).any(|w| w == ["-o", setting]),
                "{setting} missing from {options:?}"
            );
        }
        let connect_timeouts = options
            .iter()
            .filter(|o| o.starts_with("ConnectTimeout="))
            .count();
        assert_eq!(connect_timeouts, 1);

        let options = client_options(
            22,
            &creds(true, &[]),
            HostKeyPolicy::Strict,
            None,
            Duration::from_millis(300),
        );
        assert!(options.contains(&"ConnectTimeout=1".to_string()));
    }

    #[test]
    fn failures_are_classified() {
        assert!(matches!(
            classify_failure("user@h: Permission denied (publickey).", Some(255), false),
            ConnectError::Auth(_)
        ));
        let refused = "ssh: connect to host h port 22: Connection refused";
        assert!(matches!(
            classify_failure(refused, Some(255), false),
            ConnectError::Transport(_)
        ));
        let err = classify_failure("", Some(255), false);
        assert_eq!(err.to_string(), "transport failed: ssh exited with Some(255)");
    }

    #[test]
    fn reachability_follows_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let target = SshTarget {
            host: "127.0.0.1".to_string(),
            user: "ops".to_string(),
            port,
        };
        assert!(port_reachable(&target, Duration::from_secs(1)));

        drop(listener);
        assert!(!port_reachable(&target, Duration::from_secs(1)));
    }

    #[test]
    fn await_port_times_out_on_closed_port() {
        let port = TcpListener::bind("127.0.0.1:0")
            .expect("bind")
            .local_addr()
            .expect("addr")
            .port();
        let cfg = HarnessConfig {
            reachability_interval_secs: 1,
            ..HarnessConfig::default()
        };
        let manager = ConnectionManager::new(
            SshTarget {
                host: "127.0.0.1".to_string(),
                user: "ops".to_string(),
                port,
            },
            None,
            &cfg,
        );
        let err = manager.await_port(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, ConnectError::Timeout(_)));
    }
}
