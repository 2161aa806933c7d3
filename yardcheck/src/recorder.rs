//! Phase outcome accumulation and console output.

use std::io::Write;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::core::report::{PhaseResult, Summary, format_phase_line, summarize};

/// Collects phase results for one run and prints each as it arrives.
///
/// Owned by the sequencer's single control flow; never shared across threads.
pub struct Recorder<W: Write> {
    out: W,
    results: Vec<PhaseResult>,
    started: Instant,
}

impl<W: Write> Recorder<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            results: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn record_pass(&mut self, seq: usize, name: &str, duration: Duration) {
        self.push(PhaseResult {
            seq,
            name: name.to_string(),
            passed: true,
            message: String::new(),
            duration,
        });
    }

    pub fn record_fail(&mut self, seq: usize, name: &str, message: &str, duration: Duration) {
        self.push(PhaseResult {
            seq,
            name: name.to_string(),
            passed: false,
            message: message.to_string(),
            duration,
        });
    }

    /// Informational line between phases, e.g. a group heading.
    pub fn note(&mut self, text: &str) {
        self.emit(&format!("[INFO] {text}"));
    }

    /// True once any recorded phase failed.
    pub fn has_failure(&self) -> bool {
        self.results.iter().any(|r| !r.passed)
    }

    pub fn results(&self) -> &[PhaseResult] {
        &self.results
    }

    /// Totals against `declared_total`, timed from recorder creation.
    pub fn summary(&self, declared_total: usize) -> Summary {
        summarize(&self.results, declared_total, self.started.elapsed())
    }

    /// Print a free-form line, typically the final summary.
    pub fn emit(&mut self, line: &str) {
        if let Err(err) = writeln!(self.out, "{line}") {
            warn!(error = %err, "console write failed");
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn push(&mut self, result: PhaseResult) {
        if let Some(last) = self.results.last()
            && result.seq != last.seq + 1
        {
            warn!(previous = last.seq, seq = result.seq, "phase recorded out of sequence");
        }
        let line = format_phase_line(&result);
        self.results.push(result);
        self.emit(&line);
    }
}
