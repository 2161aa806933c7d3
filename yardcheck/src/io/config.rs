//! Harness configuration, read from an optional TOML file.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::core::commands::flatten_remote_name;
use crate::core::instance::{Instance, default_instances};
use crate::io::poll::RetryBudget;

/// How the remote host's identity is verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyPolicy {
    /// Verify against the user's known_hosts; unknown hosts are rejected.
    #[default]
    Strict,
    /// Verify against a dedicated pinned known_hosts file only.
    Pin,
    /// No verification. Only acceptable on a closed lab network.
    #[serde(rename = "none")]
    #[value(name = "none")]
    Disabled,
}

/// Harness configuration (TOML).
///
/// Every field has a default, so an absent file or a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Requested remote location of the provisioning tool. Directory
    /// components are dropped on upload; the tool always lands in `~`.
    pub tool_path: String,
    /// Local provisioning tool uploaded in the first phase.
    pub artifact_path: PathBuf,

    /// SSH command port on the target host.
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub host_key_policy: HostKeyPolicy,
    /// Pinned known_hosts file, required by [`HostKeyPolicy::Pin`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts: Option<PathBuf>,

    pub workload_image: String,
    /// Image running a container engine inside a workload.
    pub nested_image: String,
    pub ping_target: String,
    pub dns_name: String,

    /// Delay between successive concurrent `create` starts.
    pub create_stagger_secs: u64,
    pub nested_ready_attempts: u32,
    pub nested_ready_interval_secs: u64,

    /// Pause after issuing the reboot so the host actually goes down.
    pub reboot_settle_down_secs: u64,
    /// Upper bound on waiting for the command port to come back.
    pub reboot_max_wait_secs: u64,
    /// Pause after reconnecting so services finish starting.
    pub reboot_settle_up_secs: u64,
    pub reachability_interval_secs: u64,

    /// Captured output kept in a failure message.
    pub output_limit_bytes: usize,

    pub instances: Vec<Instance>,
    pub nested: NestedConfig,
}

/// Instance used for the deeply nested root lifecycle check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NestedConfig {
    pub prefix: String,
    pub root: String,
    pub env_file: String,
    /// Top of the scratch tree holding `root`; removed whole on cleanup.
    pub scratch_dir: String,
}

impl Default for NestedConfig {
    fn default() -> Self {
        Self {
            prefix: "dyn_".to_string(),
            root: "/tmp/dockyard-nested/level1/level2/dockyard".to_string(),
            env_file: "~/dyn.env".to_string(),
            scratch_dir: "/tmp/dockyard-nested".to_string(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            tool_path: "~/dockyard.sh".to_string(),
            artifact_path: PathBuf::from("dist/dockyard.sh"),
            port: 22,
            connect_timeout_secs: 15,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: None,
            workload_image: "alpine".to_string(),
            nested_image: "docker:26.1-dind".to_string(),
            ping_target: "1.1.1.1".to_string(),
            dns_name: "google.com".to_string(),
            create_stagger_secs: 3,
            nested_ready_attempts: 60,
            nested_ready_interval_secs: 2,
            reboot_settle_down_secs: 15,
            reboot_max_wait_secs: 4 * 60,
            reboot_settle_up_secs: 10,
            reachability_interval_secs: 5,
            output_limit_bytes: 2000,
            instances: default_instances(),
            nested: NestedConfig::default(),
        }
    }
}

impl HarnessConfig {
    pub fn validate(&self) -> Result<()> {
        if flatten_remote_name(&self.tool_path).is_none() {
            return Err(anyhow!("tool_path must name a file, got {:?}", self.tool_path));
        }
        if self.connect_timeout_secs == 0 {
            return Err(anyhow!("connect_timeout_secs must be > 0"));
        }
        if self.nested_ready_attempts == 0 {
            return Err(anyhow!("nested_ready_attempts must be > 0"));
        }
        if self.nested_ready_interval_secs == 0 || self.reachability_interval_secs == 0 {
            return Err(anyhow!("poll intervals must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.host_key_policy == HostKeyPolicy::Pin && self.known_hosts.is_none() {
            return Err(anyhow!("host_key_policy = \"pin\" requires known_hosts"));
        }
        if self.instances.len() < 2 {
            return Err(anyhow!("at least two instances are required"));
        }
        let scratch = self.nested.scratch_dir.trim_end_matches('/');
        if scratch.is_empty() || !self.nested.root.starts_with(&format!("{scratch}/")) {
            return Err(anyhow!(
                "nested root {:?} must live under scratch_dir {:?}",
                self.nested.root,
                self.nested.scratch_dir
            ));
        }
        let nested = self.nested_instance();
        let mut labels = BTreeSet::new();
        for inst in self.instances.iter().chain(std::iter::once(&nested)) {
            if inst.label.trim().is_empty() || inst.prefix.trim().is_empty() {
                return Err(anyhow!("instance label and prefix must be non-empty"));
            }
            if !labels.insert(inst.label.clone()) {
                return Err(anyhow!("duplicate instance label {:?}", inst.label));
            }
        }
        Ok(())
    }

    /// Remote path the provisioning tool is invoked from after upload.
    pub fn remote_tool(&self) -> String {
        let name =
            flatten_remote_name(&self.tool_path).unwrap_or_else(|| "dockyard.sh".to_string());
        format!("~/{name}")
    }

    pub fn nested_instance(&self) -> Instance {
        Instance::new(
            "N",
            &self.nested.prefix,
            &self.nested.root,
            &self.nested.env_file,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn create_stagger(&self) -> Duration {
        Duration::from_secs(self.create_stagger_secs)
    }

    pub fn nested_ready_budget(&self) -> RetryBudget {
        RetryBudget::Attempts {
            max: self.nested_ready_attempts,
            interval: Duration::from_secs(self.nested_ready_interval_secs),
        }
    }

    pub fn reboot_settle_down(&self) -> Duration {
        Duration::from_secs(self.reboot_settle_down_secs)
    }

    pub fn reboot_max_wait(&self) -> Duration {
        Duration::from_secs(self.reboot_max_wait_secs)
    }

    pub fn reboot_settle_up(&self) -> Duration {
        Duration::from_secs(self.reboot_settle_up_secs)
    }

    pub fn reachability_interval(&self) -> Duration {
        Duration::from_secs(self.reachability_interval_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `HarnessConfig::default()`.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    if !path.exists() {
        let cfg = HarnessConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HarnessConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Render a config as TOML with a trailing newline.
pub fn render_config(cfg: &HarnessConfig) -> Result<String> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, HarnessConfig::default());
        assert_eq!(cfg.remote_tool(), "~/dockyard.sh");
    }

    #[test]
    fn rendered_default_loads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("yardcheck.toml");
        let cfg = HarnessConfig::default();
        fs::write(&path, render_config(&cfg).expect("render")).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("yardcheck.toml");
        fs::write(
            &path,
            "tool_path = \"~/bin/deep/dockyard.sh\"\nhost_key_policy = \"none\"\ncreate_stagger_secs = 0\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.host_key_policy, HostKeyPolicy::Disabled);
        assert_eq!(cfg.create_stagger(), Duration::ZERO);
        assert_eq!(cfg.remote_tool(), "~/dockyard.sh");
        assert_eq!(cfg.instances.len(), 3);
    }

    #[test]
    fn pin_requires_known_hosts() {
        let cfg = HarnessConfig {
            host_key_policy: HostKeyPolicy::Pin,
            ..HarnessConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("requires known_hosts"));
    }

    #[test]
    fn rejects_degenerate_instance_sets() {
        let mut cfg = HarnessConfig::default();
        cfg.instances.truncate(1);
        assert!(cfg.validate().unwrap_err().to_string().contains("at least two"));

        let mut cfg = HarnessConfig::default();
        cfg.instances[2].label = "A".to_string();
        assert!(cfg.validate().unwrap_err().to_string().contains("duplicate"));
    }

    #[test]
    fn nested_root_must_sit_under_the_scratch_tree() {
        let mut cfg = HarnessConfig::default();
        cfg.nested.root = "/srv/dockyard".to_string();
        assert!(cfg.validate().unwrap_err().to_string().contains("scratch_dir"));

        let mut cfg = HarnessConfig::default();
        cfg.nested.scratch_dir = "/".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.nested.scratch_dir = "/tmp/dockyard-nested/".to_string();
        assert!(cfg.validate().is_ok());
    }
}
