//! Ordered, fail-fast phase execution.
//!
//! A [`PhasePlan`] is a table of phase groups. Sequence numbers come from each
//! phase's position in the table, so the declared total can never drift from
//! the phases that actually exist.

use std::io::Write;
use std::time::Instant;

use anyhow::{Result, anyhow};
use tracing::{debug, info_span};

use crate::recorder::Recorder;

pub type PhaseBody<X> = Box<dyn Fn(&mut X) -> Result<()>>;
pub type CleanupStep<X> = Box<dyn Fn(&mut X)>;

pub struct Phase<X> {
    name: String,
    body: PhaseBody<X>,
}

/// Phases that share setup and, optionally, a cleanup step.
pub struct PhaseGroup<X> {
    title: String,
    phases: Vec<Phase<X>>,
    cleanup: Option<CleanupStep<X>>,
}

impl<X> PhaseGroup<X> {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            phases: Vec::new(),
            cleanup: None,
        }
    }

    pub fn phase<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut X) -> Result<()> + 'static,
    {
        self.phases.push(Phase {
            name: name.into(),
            body: Box::new(body),
        });
        self
    }

    /// Runs after the group whenever at least one of its phases ran, even if
    /// one failed or fail-fast cut the group short.
    pub fn cleanup<F>(mut self, step: F) -> Self
    where
        F: Fn(&mut X) + 'static,
    {
        self.cleanup = Some(Box::new(step));
        self
    }
}

/// The full, ordered phase table plus an optional pre-flight step.
pub struct PhasePlan<X> {
    preflight: Option<CleanupStep<X>>,
    groups: Vec<PhaseGroup<X>>,
}

impl<X> Default for PhasePlan<X> {
    fn default() -> Self {
        Self::new()
    }
}

impl<X> PhasePlan<X> {
    pub fn new() -> Self {
        Self {
            preflight: None,
            groups: Vec::new(),
        }
    }

    /// Failure-tolerant step run once before the first phase.
    pub fn preflight<F>(mut self, step: F) -> Self
    where
        F: Fn(&mut X) + 'static,
    {
        self.preflight = Some(Box::new(step));
        self
    }

    pub fn group(mut self, group: PhaseGroup<X>) -> Self {
        self.groups.push(group);
        self
    }

    pub fn declared_total(&self) -> usize {
        self.groups.iter().map(|g| g.phases.len()).sum()
    }

    /// `(seq, name)` for every phase, in execution order.
    pub fn phase_names(&self) -> Vec<(usize, &str)> {
        self.groups
            .iter()
            .flat_map(|g| g.phases.iter().map(|p| p.name.as_str()))
            .enumerate()
            .map(|(idx, name)| (idx + 1, name))
            .collect()
    }
}

/// Execute `plan` against `ctx`, recording every phase that runs.
///
/// The first failure latches: no later phase runs. When `deadline` has passed
/// before a phase starts, that phase is recorded as failed instead of run;
/// phases already in flight are never interrupted.
pub fn run_plan<X, W: Write>(
    plan: &PhasePlan<X>,
    ctx: &mut X,
    recorder: &mut Recorder<W>,
    deadline: Option<Instant>,
) {
    if let Some(preflight) = &plan.preflight {
        recorder.note("pre-flight cleanup");
        preflight(ctx);
    }

    let mut seq = 0usize;
    for group in &plan.groups {
        if recorder.has_failure() {
            break;
        }
        recorder.note(&group.title);
        let mut ran_any = false;
        for phase in &group.phases {
            if recorder.has_failure() {
                break;
            }
            seq += 1;
            ran_any = true;
            let _span = info_span!("phase", seq, name = %phase.name).entered();
            let started = Instant::now();
            let outcome = if deadline.is_some_and(|d| started >= d) {
                Err(anyhow!("overall timeout exceeded before this phase started"))
            } else {
                (phase.body)(ctx)
            };
            match outcome {
                Ok(()) => recorder.record_pass(seq, &phase.name, started.elapsed()),
                Err(err) => {
                    recorder.record_fail(seq, &phase.name, &format!("{err:#}"), started.elapsed());
                }
            }
        }
        if ran_any && let Some(cleanup) = &group.cleanup {
            debug!(group = %group.title, "running group cleanup");
            cleanup(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::time::Duration;

    #[derive(Default)]
    struct Trace {
        events: Vec<String>,
    }

    fn step(name: &'static str) -> impl Fn(&mut Trace) -> Result<()> {
        move |t: &mut Trace| {
            t.events.push(name.to_string());
            Ok(())
        }
    }

    fn failing(name: &'static str) -> impl Fn(&mut Trace) -> Result<()> {
        move |t: &mut Trace| {
            t.events.push(name.to_string());
            bail!("{name} broke")
        }
    }

    fn plan_with_failure_at(fail: Option<&'static str>) -> PhasePlan<Trace> {
        let body = |name: &'static str| -> PhaseBody<Trace> {
            if Some(name) == fail {
                Box::new(failing(name))
            } else {
                Box::new(step(name))
            }
        };
        let mut first = PhaseGroup::new("first");
        for name in ["p1", "p2"] {
            first = first.phase(name, body(name));
        }
        let mut second =
            PhaseGroup::new("second").cleanup(|t: &mut Trace| t.events.push("cleanup".into()));
        for name in ["p3", "p4", "p5"] {
            second = second.phase(name, body(name));
        }
        let third = PhaseGroup::new("third").phase("p6", body("p6"));
        PhasePlan::new()
            .preflight(|t: &mut Trace| t.events.push("preflight".into()))
            .group(first)
            .group(second)
            .group(third)
    }

    #[test]
    fn declared_total_comes_from_the_table() {
        let plan = plan_with_failure_at(None);
        assert_eq!(plan.declared_total(), 6);
        assert_eq!(plan.phase_names()[3], (4, "p4"));
    }

    #[test]
    fn all_phases_run_in_order() {
        let plan = plan_with_failure_at(None);
        let mut trace = Trace::default();
        let mut recorder = Recorder::new(Vec::new());
        run_plan(&plan, &mut trace, &mut recorder, None);

        assert_eq!(
            trace.events,
            vec!["preflight", "p1", "p2", "p3", "p4", "p5", "cleanup", "p6"]
        );
        let seqs: Vec<usize> = recorder.results().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
        assert!(recorder.summary(plan.declared_total()).success());
    }

    #[test]
    fn first_failure_stops_the_run_but_group_cleanup_runs() {
        let plan = plan_with_failure_at(Some("p4"));
        let mut trace = Trace::default();
        let mut recorder = Recorder::new(Vec::new());
        run_plan(&plan, &mut trace, &mut recorder, None);

        assert_eq!(
            trace.events,
            vec!["preflight", "p1", "p2", "p3", "p4", "cleanup"]
        );
        let summary = recorder.summary(plan.declared_total());
        assert_eq!(summary.recorded, 4);
        assert_eq!(summary.skipped, 2);
        assert!(!summary.success());
        assert_eq!(recorder.results()[3].message, "p4 broke");
    }

    #[test]
    fn cleanup_is_skipped_when_group_never_started() {
        let plan = plan_with_failure_at(Some("p2"));
        let mut trace = Trace::default();
        let mut recorder = Recorder::new(Vec::new());
        run_plan(&plan, &mut trace, &mut recorder, None);

        assert_eq!(trace.events, vec!["preflight", "p1", "p2"]);
        assert_eq!(recorder.summary(plan.declared_total()).skipped, 4);
    }

    #[test]
    fn elapsed_deadline_fails_the_next_phase() {
        let plan = plan_with_failure_at(None);
        let mut trace = Trace::default();
        let mut recorder = Recorder::new(Vec::new());
        let deadline = Instant::now().checked_sub(Duration::from_secs(1));
        run_plan(&plan, &mut trace, &mut recorder, deadline);

        assert_eq!(trace.events, vec!["preflight"]);
        let results = recorder.results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].passed);
        assert!(results[0].message.contains("overall timeout"));
    }

    #[test]
    fn group_headings_are_printed() {
        let plan = plan_with_failure_at(None);
        let mut trace = Trace::default();
        let mut recorder = Recorder::new(Vec::new());
        run_plan(&plan, &mut trace, &mut recorder, None);
        let out = String::from_utf8(recorder.into_inner()).expect("utf8");
        assert!(out.starts_with("[INFO] pre-flight cleanup\n[INFO] first\n[PASS] 01 p1"));
        assert!(out.contains("[INFO] third\n[PASS] 06 p6"));
    }
}
