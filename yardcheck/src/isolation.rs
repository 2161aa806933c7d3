//! Cross-tenant negative visibility check.
//!
//! Every instance starts one long-lived workload with a unique name, then
//! every other instance's engine is asked for its workload listing: a name
//! belonging to another tenant must never appear there.

use tracing::{debug, instrument, warn};

use crate::core::checks::{fragment, listing_contains};
use crate::core::commands::Engine;
use crate::core::instance::Instance;
use crate::dispatch::for_all;
use crate::io::remote::Remote;

/// Workload started on `inst` for the isolation check, e.g. `iso-a-check`.
pub fn probe_workload(inst: &Instance) -> String {
    format!("iso-{}-check", inst.label.to_lowercase())
}

/// Run the isolation check and return one message per violation.
///
/// A leftover workload with the same name is removed before each start.
/// Instances whose workload fails to start are left out as sources but are
/// still queried as viewers. Every started workload is removed afterwards,
/// whatever the outcome; removal failures are ignored.
#[instrument(skip_all, fields(instances = instances.len()))]
pub fn check_isolation<R: Remote + ?Sized>(
    remote: &R,
    instances: &[Instance],
    image: &str,
    output_limit: usize,
) -> Vec<String> {
    let starts = for_all(remote, instances, |r, inst| {
        let engine = Engine::for_instance(inst);
        let name = probe_workload(inst);
        let _ = r.run(&engine.remove(&name));
        let out = r.run(&engine.run_detached(&name, image, "sleep 300"));
        if out.success() {
            Ok(())
        } else {
            Err(fragment(&out.combined(), output_limit))
        }
    });
    let started: Vec<&Instance> = instances
        .iter()
        .filter(|inst| starts.iter().any(|r| r.ok && r.label == inst.label))
        .collect();
    for failure in starts.iter().filter(|r| !r.ok) {
        warn!(label = %failure.label, message = %failure.message, "isolation workload did not start");
    }
    if started.is_empty() {
        warn!("no isolation workload started; nothing to compare");
    }

    let mut violations = Vec::new();
    for viewer in instances {
        let sources: Vec<&&Instance> = started
            .iter()
            .filter(|source| source.label != viewer.label)
            .collect();
        if sources.is_empty() {
            continue;
        }
        let listing = remote.run(&Engine::for_instance(viewer).list_names());
        if !listing.success() {
            violations.push(format!(
                "[{}] listing failed: {}",
                viewer.label,
                fragment(&listing.combined(), output_limit)
            ));
            continue;
        }
        for source in sources {
            let name = probe_workload(source);
            if listing_contains(&listing.stdout, &name) {
                violations.push(format!(
                    "{name} from {} is visible to {}",
                    source.label, viewer.label
                ));
            }
        }
    }

    for inst in &started {
        let _ = remote.run(&Engine::for_instance(inst).remove(&probe_workload(inst)));
    }
    debug!(violations = violations.len(), "isolation check finished");
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::instance::default_instances;
    use crate::test_support::{FakeRemote, SimulatedHost, failed, ok};

    fn is_listing(cmd: &str) -> bool {
        cmd.contains(" ps -a ")
    }

    #[test]
    fn clean_listings_pass_and_workloads_are_removed() {
        let remote = FakeRemote::new(|cmd| {
            if cmd.contains("/dy1/") && is_listing(cmd) {
                ok("iso-a-check\n")
            } else if cmd.contains("/dy2/") && is_listing(cmd) {
                ok("iso-b-check\n")
            } else if cmd.contains("/dy3/") && is_listing(cmd) {
                ok("iso-c-check\n")
            } else {
                ok("")
            }
        });
        let violations = check_isolation(&remote, &default_instances(), "alpine", 2000);
        assert!(violations.is_empty(), "{violations:?}");

        let removals: Vec<String> = remote
            .calls()
            .into_iter()
            .map(|c| c.command)
            .filter(|c| c.contains(" rm -f "))
            .collect();
        assert_eq!(removals.len(), 6);
        assert!(removals.iter().any(|c| c.contains("rm -f iso-c-check")));
    }

    #[test]
    fn foreign_workload_in_listing_is_a_violation() {
        let remote = FakeRemote::new(|cmd| {
            if cmd.contains("/dy2/") && is_listing(cmd) {
                ok("iso-b-check\niso-a-check\n")
            } else {
                ok("")
            }
        });
        let violations = check_isolation(&remote, &default_instances(), "alpine", 2000);
        assert_eq!(violations, vec!["iso-a-check from A is visible to B"]);
    }

    #[test]
    fn name_prefix_is_not_a_match() {
        let remote = FakeRemote::new(|cmd| {
            if is_listing(cmd) {
                ok("iso-a-check-old\n")
            } else {
                ok("")
            }
        });
        let violations = check_isolation(&remote, &default_instances(), "alpine", 2000);
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn failed_start_skips_source_but_keeps_viewer() {
        let remote = FakeRemote::new(|cmd| {
            if cmd.contains("--name iso-c-check") {
                failed(125, "image not found")
            } else if cmd.contains("/dy3/") && is_listing(cmd) {
                ok("iso-a-check\n")
            } else {
                ok("")
            }
        });
        let violations = check_isolation(&remote, &default_instances(), "alpine", 2000);
        assert_eq!(violations, vec!["iso-a-check from A is visible to C"]);

        let commands: Vec<String> = remote.calls().into_iter().map(|c| c.command).collect();
        let removals = |name: &str| {
            commands
                .iter()
                .filter(|c| c.contains(&format!("rm -f {name}")))
                .count()
        };
        assert_eq!(removals("iso-c-check"), 1);
        assert_eq!(removals("iso-a-check"), 2);
    }

    #[test]
    fn leftover_workload_is_replaced_and_still_checked() {
        let host = SimulatedHost::new();
        for (prefix, root) in [("dy1_", "/dy1"), ("dy2_", "/dy2"), ("dy3_", "/dy3")] {
            host.seed_tenant(prefix, root);
        }
        host.seed_container("dy1_", "iso-a-check");
        host.leak_into("dy2_", "iso-a-check");

        let violations = check_isolation(&host, &default_instances(), "alpine", 2000);
        assert_eq!(violations, vec!["iso-a-check from A is visible to B"]);

        let commands = host.commands();
        let remove = commands
            .iter()
            .position(|c| c.contains("/dy1/") && c.contains("rm -f iso-a-check"))
            .expect("stale workload removed");
        let start = commands
            .iter()
            .position(|c| c.contains("--name iso-a-check"))
            .expect("workload started");
        assert!(remove < start);
        assert!(host.containers("dy1_").is_empty());
    }

    #[test]
    fn unreadable_listing_is_reported() {
        let remote = FakeRemote::new(|cmd| {
            if cmd.contains("/dy1/") && is_listing(cmd) {
                failed(1, "Cannot connect to the Docker daemon")
            } else {
                ok("")
            }
        });
        let violations = check_isolation(&remote, &default_instances(), "alpine", 2000);
        assert_eq!(
            violations,
            vec!["[A] listing failed: Cannot connect to the Docker daemon"]
        );
    }
}
