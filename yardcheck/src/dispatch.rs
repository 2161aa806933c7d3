//! Concurrent per-instance probe dispatch.
//!
//! One thread per instance; every thread opens its own sub-sessions on the
//! shared channel. The call joins all threads before returning, and results
//! are sorted by label so output is deterministic whatever the completion
//! order. Fan-out equals the instance count, which is small and fixed; bound
//! concurrency explicitly before reusing this for large sets.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::core::instance::Instance;
use crate::core::probe::{ProbeResult, sort_by_label};
use crate::io::remote::Remote;

/// Run `probe` against every instance concurrently.
///
/// Always yields exactly one result per instance, sorted by label. A probe
/// that panics counts as a failure of its instance.
pub fn for_all<R, F>(remote: &R, instances: &[Instance], probe: F) -> Vec<ProbeResult>
where
    R: Remote + ?Sized,
    F: Fn(&R, &Instance) -> Result<(), String> + Sync,
{
    for_all_staggered(remote, instances, Duration::ZERO, probe)
}

/// Like [`for_all`], but the task for the i-th instance waits `i * stagger`
/// before probing.
#[instrument(skip_all, fields(instances = instances.len(), stagger_ms = stagger.as_millis()))]
pub fn for_all_staggered<R, F>(
    remote: &R,
    instances: &[Instance],
    stagger: Duration,
    probe: F,
) -> Vec<ProbeResult>
where
    R: Remote + ?Sized,
    F: Fn(&R, &Instance) -> Result<(), String> + Sync,
{
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        for (idx, inst) in instances.iter().enumerate() {
            let tx = tx.clone();
            let probe = &probe;
            scope.spawn(move || {
                let delay = stagger.saturating_mul(u32::try_from(idx).unwrap_or(u32::MAX));
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                let outcome = catch_unwind(AssertUnwindSafe(|| probe(remote, inst)))
                    .unwrap_or_else(|_| Err("probe panicked".to_string()));
                if let Err(message) = &outcome {
                    warn!(label = %inst.label, %message, "probe failed");
                }
                // The receiver outlives the scope, so the send cannot fail.
                let _ = tx.send(ProbeResult::from_outcome(&inst.label, outcome));
            });
        }
    });
    drop(tx);

    let mut results: Vec<ProbeResult> = rx.into_iter().collect();
    sort_by_label(&mut results);
    debug!(results = results.len(), "dispatch joined");
    results
}
