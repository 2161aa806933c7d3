//! Command-line shaping for the remote collaborators.
//!
//! Two external tools are driven purely through shell command strings: the
//! provisioning tool (`gen-env | create | destroy`) and the container engine
//! client bound to one instance's control socket. Nothing here executes
//! anything; callers hand the strings to a [`crate::io::remote::Remote`].

use std::path::Path;

use crate::core::instance::Instance;

/// Make a command best-effort: errors are silenced and the exit status is 0.
///
/// Used for cleanup, where a missing target must never count as a failure.
pub fn tolerant(command: &str) -> String {
    format!("{command} 2>/dev/null; true")
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Base name a remote upload lands under.
///
/// Any directory component in `hint` is discarded: uploads always land
/// directly in the remote home directory. Returns `None` when `hint` has no
/// usable final component (empty, `..`).
pub fn flatten_remote_name(hint: &str) -> Option<String> {
    let relative = hint.strip_prefix("~/").unwrap_or(hint);
    Path::new(relative)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Remote pipeline that stores stdin as `~/<name>` and marks it executable.
pub fn upload_pipeline(name: &str) -> String {
    let quoted = shell_quote(name);
    format!("cat > ~/{quoted} && chmod +x ~/{quoted}")
}

/// Provisioning tool invocations.
#[derive(Debug, Clone, Copy)]
pub struct Provisioner<'a> {
    tool: &'a str,
}

impl<'a> Provisioner<'a> {
    /// `tool` is the remote path of the uploaded provisioning script.
    pub fn new(tool: &'a str) -> Self {
        Self { tool }
    }

    pub fn gen_env(&self, inst: &Instance) -> String {
        format!(
            "rm -f {env} && DOCKYARD_ENV={env} DOCKYARD_ROOT={root} DOCKYARD_DOCKER_PREFIX={prefix} {tool} gen-env",
            env = inst.env_file,
            root = inst.root,
            prefix = inst.prefix,
            tool = self.tool,
        )
    }

    pub fn create(&self, inst: &Instance) -> String {
        format!("DOCKYARD_ENV={} sudo -E {} create", inst.env_file, self.tool)
    }

    pub fn destroy(&self, inst: &Instance) -> String {
        format!(
            "DOCKYARD_ENV={} sudo -E {} destroy --yes",
            inst.env_file, self.tool
        )
    }

    /// Destroy only when the environment file is present; never fails.
    pub fn destroy_if_present(&self, inst: &Instance) -> String {
        tolerant(&format!("[ -f {} ] && {}", inst.env_file, self.destroy(inst)))
    }
}

/// Container engine client bound to one control socket.
#[derive(Debug, Clone, Copy)]
pub struct Engine<'a> {
    socket: &'a str,
}

impl<'a> Engine<'a> {
    pub fn new(socket: &'a str) -> Self {
        Self { socket }
    }

    pub fn for_instance(inst: &'a Instance) -> Self {
        Self::new(&inst.socket)
    }

    fn docker(&self) -> String {
        format!("sudo DOCKER_HOST=unix://{} docker", self.socket)
    }

    /// Run a throwaway workload and wait for it to exit.
    pub fn run_once(&self, image: &str, args: &str) -> String {
        format!("{} run --rm {image} {args}", self.docker())
    }

    /// Start a named, detached workload.
    pub fn run_detached(&self, name: &str, image: &str, args: &str) -> String {
        let base = format!("{} run -d --name {name} {image}", self.docker());
        if args.is_empty() {
            base
        } else {
            format!("{base} {args}")
        }
    }

    /// Execute `args` inside the running workload `name`.
    pub fn exec(&self, name: &str, args: &str) -> String {
        format!("{} exec {name} {args}", self.docker())
    }

    /// Force-remove a workload; never fails.
    pub fn remove(&self, name: &str) -> String {
        tolerant(&format!("{} rm -f {name}", self.docker()))
    }

    /// List every workload name known to this engine, one per line.
    pub fn list_names(&self) -> String {
        format!("{} ps -a --format '{{{{.Names}}}}'", self.docker())
    }
}

pub fn service_active(unit: &str) -> String {
    format!("systemctl is-active {unit}")
}

pub fn service_stop(unit: &str) -> String {
    format!("sudo systemctl stop {unit}")
}

pub fn service_start(unit: &str) -> String {
    format!("sudo systemctl start {unit}")
}

pub fn link_show(bridge: &str) -> String {
    format!("ip link show {bridge}")
}

/// Firewall rules mentioning `prefix`; exits 0 whether or not any exist.
pub fn firewall_rules(prefix: &str) -> String {
    format!("iptables-save | grep -F {prefix} || true")
}

/// Prints `exists` or `gone`; always exits 0.
pub fn dir_probe(path: &str) -> String {
    format!("[ -d {path} ] && echo exists || echo gone")
}

pub fn socket_stat(socket: &str) -> String {
    format!("stat -c '%a %G' {socket}")
}

pub fn account_lookup(database: &str, name: &str) -> String {
    format!("getent {database} {name}")
}

/// Remove the directory tree at `path`; never fails.
pub fn remove_tree(path: &str) -> String {
    tolerant(&format!("sudo rm -rf {path}"))
}

/// Tear down everything a previous run may have left behind for `inst`.
///
/// Every command is tolerant, so a target that does not exist never fails.
pub fn residue_cleanup(tool: &Provisioner<'_>, inst: &Instance) -> Vec<String> {
    let service = inst.service();
    vec![
        tool.destroy_if_present(inst),
        tolerant(&format!("sudo rm -rf /run/{service}")),
        remove_tree(&inst.root),
        tolerant(&format!("sudo ip link delete {}", inst.bridge())),
        tolerant(&format!(
            "sudo systemctl stop {service} 2>/dev/null; sudo systemctl disable {service}"
        )),
        tolerant(&format!("sudo rm -f /etc/systemd/system/{service}.service")),
        tolerant(&format!("rm -f {}", inst.env_file)),
    ]
}

/// Full pre-flight cleanup for every tenant plus the nested-root instance,
/// whose whole `scratch` tree goes with it.
pub fn preflight_cleanup(
    tool: &Provisioner<'_>,
    instances: &[Instance],
    nested: &Instance,
    scratch: &str,
) -> Vec<String> {
    let mut commands: Vec<String> = instances
        .iter()
        .chain(std::iter::once(nested))
        .flat_map(|inst| residue_cleanup(tool, inst))
        .collect();
    commands.push(remove_tree(scratch));
    commands.push(tolerant("sudo systemctl daemon-reload"));
    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instance::default_instances;

    #[test]
    fn flatten_discards_directories() {
        assert_eq!(
            flatten_remote_name("level1/level2/name").as_deref(),
            Some("name")
        );
        assert_eq!(
            flatten_remote_name("~/dockyard.sh").as_deref(),
            Some("dockyard.sh")
        );
        assert_eq!(
            flatten_remote_name("~/a/b/dockyard.sh").as_deref(),
            Some("dockyard.sh")
        );
        assert_eq!(flatten_remote_name(""), None);
        assert_eq!(flatten_remote_name(".."), None);
    }

    #[test]
    fn upload_pipeline_targets_home() {
        assert_eq!(
            upload_pipeline("dockyard.sh"),
            "cat > ~/'dockyard.sh' && chmod +x ~/'dockyard.sh'"
        );
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn provisioner_shapes_env_assignments() {
        let inst = &default_instances()[0];
        let tool = Provisioner::new("~/dockyard.sh");
        assert_eq!(
            tool.gen_env(inst),
            "rm -f ~/dy1.env && DOCKYARD_ENV=~/dy1.env DOCKYARD_ROOT=/dy1 DOCKYARD_DOCKER_PREFIX=dy1_ ~/dockyard.sh gen-env"
        );
        assert_eq!(
            tool.destroy(inst),
            "DOCKYARD_ENV=~/dy1.env sudo -E ~/dockyard.sh destroy --yes"
        );
        assert!(tool.destroy_if_present(inst).ends_with("; true"));
    }

    #[test]
    fn engine_targets_instance_socket() {
        let inst = &default_instances()[1];
        let engine = Engine::for_instance(inst);
        assert_eq!(
            engine.run_once("alpine", "echo hello"),
            "sudo DOCKER_HOST=unix:///dy2/run/docker.sock docker run --rm alpine echo hello"
        );
        assert_eq!(
            engine.list_names(),
            "sudo DOCKER_HOST=unix:///dy2/run/docker.sock docker ps -a --format '{{.Names}}'"
        );
        assert_eq!(
            engine.run_detached("iso-b-check", "alpine", "sleep 300"),
            "sudo DOCKER_HOST=unix:///dy2/run/docker.sock docker run -d --name iso-b-check alpine sleep 300"
        );
        assert_eq!(
            engine.run_detached("dind-b", "docker:26.1-dind", ""),
            "sudo DOCKER_HOST=unix:///dy2/run/docker.sock docker run -d --name dind-b docker:26.1-dind"
        );
    }

    #[test]
    fn preflight_commands_never_fail() {
        let instances = default_instances();
        let nested = Instance::new("N", "dyn_", "/tmp/dockyard-nested/x", "~/dyn.env");
        let commands = preflight_cleanup(
            &Provisioner::new("~/dockyard.sh"),
            &instances,
            &nested,
            "/tmp/dockyard-nested",
        );
        assert_eq!(commands.len(), 4 * 7 + 2);
        assert!(commands.iter().all(|cmd| cmd.ends_with("; true")));
        assert!(commands.iter().any(|cmd| cmd.contains("rm -rf /tmp/dockyard-nested/x")));
        assert_eq!(
            commands[commands.len() - 2],
            "sudo rm -rf /tmp/dockyard-nested 2>/dev/null; true"
        );
    }
}
