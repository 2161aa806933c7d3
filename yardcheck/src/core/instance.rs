//! Tenant instance descriptors.

use serde::{Deserialize, Serialize};

/// One namespaced tenant managed by the provisioning tool.
///
/// Instances are created once at startup as a fixed ordered set and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Short label used in console output (`A`, `B`, ...).
    pub label: String,
    /// Namespace prefix applied to the service, bridge, user and group.
    pub prefix: String,
    /// Filesystem root of the instance.
    pub root: String,
    /// Environment file produced by `gen-env`.
    pub env_file: String,
    /// Control socket of the instance's container engine.
    pub socket: String,
}

impl Instance {
    /// Build an instance whose control socket lives at `<root>/run/docker.sock`.
    pub fn new(label: &str, prefix: &str, root: &str, env_file: &str) -> Self {
        Self {
            label: label.to_string(),
            prefix: prefix.to_string(),
            root: root.to_string(),
            env_file: env_file.to_string(),
            socket: format!("{}/run/docker.sock", root.trim_end_matches('/')),
        }
    }

    /// Name shared by the engine service unit, system user and group.
    pub fn service(&self) -> String {
        format!("{}docker", self.prefix)
    }

    /// Name of the instance's network bridge.
    pub fn bridge(&self) -> String {
        format!("{}docker0", self.prefix)
    }

    /// Workload name unique to this instance, e.g. `dind-a` for stem `dind`.
    pub fn workload(&self, stem: &str) -> String {
        format!("{stem}-{}", self.label.to_lowercase())
    }
}

/// The default tenant set: three instances side by side on one host.
pub fn default_instances() -> Vec<Instance> {
    vec![
        Instance::new("A", "dy1_", "/dy1", "~/dy1.env"),
        Instance::new("B", "dy2_", "/dy2", "~/dy2.env"),
        Instance::new("C", "dy3_", "/dy3", "~/dy3.env"),
    ]
}

/// Labels joined with `+`, e.g. `A+B+C`.
pub fn joined_labels(instances: &[Instance]) -> String {
    instances
        .iter()
        .map(|inst| inst.label.as_str())
        .collect::<Vec<_>>()
        .join("+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_derives_from_root() {
        let inst = Instance::new("X", "dx_", "/tmp/deep/root/", "~/dx.env");
        assert_eq!(inst.socket, "/tmp/deep/root/run/docker.sock");
        assert_eq!(inst.service(), "dx_docker");
        assert_eq!(inst.bridge(), "dx_docker0");
        assert_eq!(inst.workload("iso"), "iso-x");
    }

    #[test]
    fn default_set_matches_expected_layout() {
        let instances = default_instances();
        assert_eq!(joined_labels(&instances), "A+B+C");
        assert_eq!(instances[1].socket, "/dy2/run/docker.sock");
        assert_eq!(instances[2].env_file, "~/dy3.env");
    }
}
