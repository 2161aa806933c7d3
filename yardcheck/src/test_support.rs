//! Test doubles for the remote channel.
//!
//! [`FakeRemote`] answers every command through a closure. [`SimulatedHost`]
//! models just enough of a host running the provisioning tool to drive the
//! whole suite end to end, and [`FakeConnector`] hands it out as a channel.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::io::config::HarnessConfig;
use crate::io::poll::PollTimeout;
use crate::io::remote::{Connect, Remote, RemoteOutput};
use crate::io::ssh::ConnectError;

/// Successful output with `stdout`.
pub fn ok(stdout: &str) -> RemoteOutput {
    RemoteOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: 0,
    }
}

/// Failed output with `code` and `stderr`.
pub fn failed(code: i32, stderr: &str) -> RemoteOutput {
    RemoteOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
        exit_code: code,
    }
}

/// One command seen by a fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

type Handler = Box<dyn Fn(&str) -> RemoteOutput + Send + Sync>;

/// Remote whose answers come from a closure; every call is recorded.
pub struct FakeRemote {
    handler: Handler,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeRemote {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> RemoteOutput + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every command exits 0 with no output.
    pub fn succeeding() -> Self {
        Self::new(|_| ok(""))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }
}

impl Remote for FakeRemote {
    fn exec(&self, command: &str, stdin: Option<&[u8]>) -> RemoteOutput {
        lock(&self.calls).push(RecordedCall {
            command: command.to_string(),
            stdin: stdin.map(<[u8]>::to_vec),
        });
        (self.handler)(command)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Config for suite runs against [`SimulatedHost`]: no stagger, no settle
/// pauses, and `artifact` as the uploaded tool.
pub fn fast_config(artifact: &Path) -> HarnessConfig {
    HarnessConfig {
        artifact_path: artifact.to_path_buf(),
        create_stagger_secs: 0,
        reboot_settle_down_secs: 0,
        reboot_settle_up_secs: 0,
        reboot_max_wait_secs: 1,
        nested_ready_attempts: 3,
        ..HarnessConfig::default()
    }
}

#[derive(Debug, Clone)]
struct EnvFile {
    root: String,
    prefix: String,
}

#[derive(Debug, Clone)]
struct Tenant {
    socket: String,
    root: String,
    active: bool,
    containers: BTreeSet<String>,
}

#[derive(Debug)]
struct HostState {
    up: bool,
    calls: Vec<String>,
    uploads: BTreeSet<String>,
    envs: BTreeMap<String, EnvFile>,
    /// Keyed by namespace prefix.
    tenants: BTreeMap<String, Tenant>,
    failures: Vec<(String, RemoteOutput)>,
    /// (viewer prefix, workload name) pairs that leak into a listing.
    leaks: Vec<(String, String)>,
    create_starts: Vec<(String, Instant)>,
    reboots: u32,
}

/// In-memory host running the provisioning tool and per-tenant engines.
///
/// Clones share state, so a test keeps one handle for assertions while the
/// suite drives another.
#[derive(Debug, Clone)]
pub struct SimulatedHost {
    state: Arc<Mutex<HostState>>,
}

impl Default for SimulatedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                up: true,
                calls: Vec::new(),
                uploads: BTreeSet::new(),
                envs: BTreeMap::new(),
                tenants: BTreeMap::new(),
                failures: Vec::new(),
                leaks: Vec::new(),
                create_starts: Vec::new(),
                reboots: 0,
            })),
        }
    }

    /// Answer every command containing `needle` with `output`.
    pub fn fail_when(&self, needle: &str, output: RemoteOutput) {
        lock(&self.state).failures.push((needle.to_string(), output));
    }

    /// Make `name` show up in the workload listing of the tenant `viewer_prefix`.
    pub fn leak_into(&self, viewer_prefix: &str, name: &str) {
        lock(&self.state)
            .leaks
            .push((viewer_prefix.to_string(), name.to_string()));
    }

    /// Leave a tenant behind as if an earlier run had crashed.
    pub fn seed_tenant(&self, prefix: &str, root: &str) {
        let mut state = lock(&self.state);
        state.tenants.insert(prefix.to_string(), Tenant::new(root));
    }

    /// Leave a stopped workload named `name` in the tenant `prefix`.
    pub fn seed_container(&self, prefix: &str, name: &str) {
        if let Some(tenant) = lock(&self.state).tenants.get_mut(prefix) {
            tenant.containers.insert(name.to_string());
        }
    }

    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        lock(&self.state).uploads.iter().cloned().collect()
    }

    pub fn tenant_exists(&self, prefix: &str) -> bool {
        lock(&self.state).tenants.contains_key(prefix)
    }

    pub fn containers(&self, prefix: &str) -> Vec<String> {
        lock(&self.state)
            .tenants
            .get(prefix)
            .map(|t| t.containers.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Start time of each `create`, in the order they arrived.
    pub fn create_starts(&self) -> Vec<(String, Instant)> {
        lock(&self.state).create_starts.clone()
    }

    pub fn reboots(&self) -> u32 {
        lock(&self.state).reboots
    }

    fn power_on(&self) {
        lock(&self.state).up = true;
    }
}

impl Remote for SimulatedHost {
    fn exec(&self, command: &str, stdin: Option<&[u8]>) -> RemoteOutput {
        let mut state = lock(&self.state);
        state.calls.push(command.to_string());
        if !state.up {
            return RemoteOutput::session_failed("ssh: connect to host: Connection refused");
        }
        if let Some((_, output)) = state
            .failures
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
        {
            return output.clone();
        }
        if let Some(inner) = command.strip_suffix(" 2>/dev/null; true") {
            let output = state.execute(inner, stdin);
            return RemoteOutput {
                exit_code: 0,
                ..output
            };
        }
        state.execute(command, stdin)
    }
}

impl Tenant {
    fn new(root: &str) -> Self {
        Self {
            socket: format!("{root}/run/docker.sock"),
            root: root.to_string(),
            active: true,
            containers: BTreeSet::new(),
        }
    }
}

/// Value of `KEY=value` in a command line.
fn assignment<'a>(command: &'a str, key: &str) -> Option<&'a str> {
    command
        .split_whitespace()
        .find_map(|token| token.strip_prefix(key)?.strip_prefix('='))
}

impl HostState {
    fn execute(&mut self, command: &str, stdin: Option<&[u8]>) -> RemoteOutput {
        if let Some(rest) = command.strip_prefix("cat > ~/'") {
            let name = rest.split('\'').next().unwrap_or_default();
            if stdin.is_none() {
                return failed(1, "no input");
            }
            self.uploads.insert(name.to_string());
            return ok("");
        }
        if command == "sudo reboot" {
            for tenant in self.tenants.values_mut() {
                tenant.containers.clear();
            }
            self.up = false;
            self.reboots += 1;
            return RemoteOutput::session_failed("Connection to host closed by remote host.");
        }
        if let Some(rest) = command.strip_prefix("[ -f ") {
            let Some((env, tail)) = rest.split_once(" ] && ") else {
                return failed(2, "syntax error");
            };
            if !self.envs.contains_key(env) {
                return failed(1, "");
            }
            return self.execute(tail, stdin);
        }
        if command.ends_with(" gen-env") {
            return self.gen_env(command);
        }
        if command.ends_with(" create") {
            return self.create(command);
        }
        if command.ends_with(" destroy --yes") {
            return self.destroy(command);
        }
        if let Some(rest) = command.strip_prefix("sudo DOCKER_HOST=unix://") {
            let Some((socket, args)) = rest.split_once(" docker ") else {
                return failed(127, "docker: command not found");
            };
            return self.docker(socket, args);
        }
        if let Some(unit) = command.strip_prefix("systemctl is-active ") {
            return match self.tenant_by_unit(unit) {
                Some(tenant) if tenant.active => ok("active\n"),
                _ => RemoteOutput {
                    stdout: "inactive\n".to_string(),
                    stderr: String::new(),
                    exit_code: 3,
                },
            };
        }
        if let Some(unit) = command.strip_prefix("sudo systemctl stop ") {
            let unit = unit.split_whitespace().next().unwrap_or_default();
            if let Some(tenant) = self.tenant_by_unit_mut(unit) {
                tenant.active = false;
            }
            return ok("");
        }
        if let Some(unit) = command.strip_prefix("sudo systemctl start ") {
            return match self.tenant_by_unit_mut(unit) {
                Some(tenant) => {
                    tenant.active = true;
                    ok("")
                }
                None => failed(5, &format!("Unit {unit}.service not found.")),
            };
        }
        if let Some(bridge) = command.strip_prefix("ip link show ") {
            let exists = bridge
                .strip_suffix("docker0")
                .is_some_and(|prefix| self.tenants.contains_key(prefix));
            return if exists {
                ok(&format!("7: {bridge}: <BROADCAST,MULTICAST,UP> mtu 1500\n"))
            } else {
                failed(1, &format!("Device \"{bridge}\" does not exist."))
            };
        }
        if let Some(rest) = command.strip_prefix("iptables-save | grep -F ") {
            let prefix = rest.trim_end_matches(" || true");
            return if self.tenants.contains_key(prefix) {
                ok(&format!("-A FORWARD -i {prefix}docker0 -j ACCEPT\n"))
            } else {
                ok("")
            };
        }
        if let Some(rest) = command.strip_prefix("[ -d ") {
            let path = rest.split(" ]").next().unwrap_or_default();
            let exists = self.tenants.values().any(|t| {
                path == t.root
                    || path == format!("{}/run", t.root)
                    || path == format!("{}/run/sysbox", t.root)
            });
            return ok(if exists { "exists\n" } else { "gone\n" });
        }
        if let Some(socket) = command.strip_prefix("stat -c '%a %G' ") {
            return match self.tenants.iter().find(|(_, t)| t.socket == socket) {
                Some((prefix, _)) => ok(&format!("660 {prefix}docker\n")),
                None => failed(
                    1,
                    &format!("stat: cannot statx '{socket}': No such file or directory"),
                ),
            };
        }
        if let Some(rest) = command.strip_prefix("getent ") {
            let name = rest.split_whitespace().nth(1).unwrap_or_default();
            return match self.tenant_by_unit(name) {
                Some(_) => ok(&format!("{name}:x:998:998::/nonexistent:/usr/sbin/nologin\n")),
                None => failed(2, ""),
            };
        }
        if let Some(path) = command.strip_prefix("sudo rm -rf ") {
            let nested = format!("{path}/");
            self.tenants
                .retain(|_, tenant| tenant.root != path && !tenant.root.starts_with(&nested));
            return ok("");
        }
        if let Some(path) = command.strip_prefix("rm -f ") {
            self.envs.remove(path.trim());
            return ok("");
        }
        ok("")
    }

    fn gen_env(&mut self, command: &str) -> RemoteOutput {
        let tool = command
            .split_whitespace()
            .rev()
            .nth(1)
            .unwrap_or_default();
        if !self.uploads.contains(tool.trim_start_matches("~/")) {
            return failed(127, &format!("{tool}: No such file or directory"));
        }
        let (Some(env), Some(root), Some(prefix)) = (
            assignment(command, "DOCKYARD_ENV"),
            assignment(command, "DOCKYARD_ROOT"),
            assignment(command, "DOCKYARD_DOCKER_PREFIX"),
        ) else {
            return failed(1, "gen-env: missing DOCKYARD_* variables");
        };
        self.envs.insert(
            env.to_string(),
            EnvFile {
                root: root.to_string(),
                prefix: prefix.to_string(),
            },
        );
        ok(&format!("wrote {env}\n"))
    }

    fn env_of(&self, command: &str) -> Option<EnvFile> {
        let path = assignment(command, "DOCKYARD_ENV")?;
        self.envs.get(path).cloned()
    }

    fn create(&mut self, command: &str) -> RemoteOutput {
        let Some(env) = self.env_of(command) else {
            return failed(1, "create: environment file not found");
        };
        self.create_starts.push((env.prefix.clone(), Instant::now()));
        if self.tenants.contains_key(&env.prefix) {
            return failed(1, &format!("create: {}docker already exists", env.prefix));
        }
        self.tenants.insert(env.prefix.clone(), Tenant::new(&env.root));
        ok(&format!("{}docker is running\n", env.prefix))
    }

    fn destroy(&mut self, command: &str) -> RemoteOutput {
        let Some(env) = self.env_of(command) else {
            return failed(1, "destroy: environment file not found");
        };
        match self.tenants.remove(&env.prefix) {
            Some(_) => ok(&format!("{}docker destroyed\n", env.prefix)),
            None => ok("nothing to destroy\n"),
        }
    }

    fn docker(&mut self, socket: &str, args: &str) -> RemoteOutput {
        let leaks: Vec<String> = self
            .tenants
            .iter()
            .find(|(_, t)| t.socket == socket)
            .map(|(prefix, _)| {
                self.leaks
                    .iter()
                    .filter(|(viewer, _)| viewer == prefix)
                    .map(|(_, name)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        let Some(tenant) = self
            .tenants
            .values_mut()
            .find(|t| t.socket == socket && t.active)
        else {
            return failed(
                1,
                &format!("Cannot connect to the Docker daemon at unix://{socket}. Is the docker daemon running?"),
            );
        };

        if let Some(rest) = args.strip_prefix("run --rm ") {
            let command = rest.split_once(' ').map_or("", |(_, command)| command);
            return workload_output(command);
        }
        if let Some(rest) = args.strip_prefix("run -d --name ") {
            let name = rest.split_whitespace().next().unwrap_or_default();
            if !tenant.containers.insert(name.to_string()) {
                return failed(
                    125,
                    &format!("Conflict. The container name \"/{name}\" is already in use"),
                );
            }
            return ok("3f5e2c9b1a7d\n");
        }
        if let Some(rest) = args.strip_prefix("exec ") {
            let (name, command) = rest.split_once(' ').unwrap_or((rest, ""));
            if !tenant.containers.contains(name) {
                return failed(1, &format!("Error response from daemon: No such container: {name}"));
            }
            return workload_output(command);
        }
        if let Some(name) = args.strip_prefix("rm -f ") {
            return if tenant.containers.remove(name) {
                ok(&format!("{name}\n"))
            } else {
                failed(1, &format!("Error response from daemon: No such container: {name}"))
            };
        }
        if args.starts_with("ps -a") {
            let mut listing: String = tenant
                .containers
                .iter()
                .chain(leaks.iter())
                .map(|name| format!("{name}\n"))
                .collect();
            if listing.is_empty() {
                listing.push('\n');
            }
            return ok(&listing);
        }
        failed(125, &format!("unknown docker invocation: {args}"))
    }

    fn tenant_by_unit(&self, unit: &str) -> Option<&Tenant> {
        self.tenants.get(unit.strip_suffix("docker")?)
    }

    fn tenant_by_unit_mut(&mut self, unit: &str) -> Option<&mut Tenant> {
        self.tenants.get_mut(unit.strip_suffix("docker")?)
    }
}

/// What a workload (or a nested engine inside one) prints for `command`.
fn workload_output(command: &str) -> RemoteOutput {
    let command = command
        .strip_prefix("docker run --rm ")
        .and_then(|rest| rest.split_once(' '))
        .map_or(command, |(_, inner)| inner);
    if command == "docker info" {
        return ok("Server Version: 26.1.0\n");
    }
    if let Some(text) = command.strip_prefix("echo ") {
        return ok(&format!("{text}\n"));
    }
    if command.starts_with("ping ") {
        return ok("3 packets transmitted, 3 packets received, 0% packet loss\n");
    }
    if command.starts_with("nslookup ") {
        return ok("Server:\t\t10.0.0.2\nName:\tgoogle.com\nAddress: 142.250.74.46\n");
    }
    ok("")
}

/// Connector handing out a [`SimulatedHost`] as the channel.
#[derive(Debug, Clone)]
pub struct FakeConnector {
    host: SimulatedHost,
    refuse_reconnect: bool,
}

impl FakeConnector {
    pub fn new(host: SimulatedHost) -> Self {
        Self {
            host,
            refuse_reconnect: false,
        }
    }

    /// The host never comes back after a reboot.
    pub fn refusing_reconnect(mut self) -> Self {
        self.refuse_reconnect = true;
        self
    }
}

impl Connect for FakeConnector {
    type Channel = SimulatedHost;

    fn connect(&self) -> Result<SimulatedHost, ConnectError> {
        Ok(self.host.clone())
    }

    fn reconnect(
        &self,
        channel: &mut SimulatedHost,
        max_wait: Duration,
    ) -> Result<(), ConnectError> {
        if self.refuse_reconnect {
            return Err(ConnectError::Timeout(PollTimeout {
                attempts: 1,
                elapsed: max_wait,
            }));
        }
        self.host.power_on();
        *channel = self.host.clone();
        Ok(())
    }
}
