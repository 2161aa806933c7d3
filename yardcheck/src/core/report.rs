//! Phase results, run summary arithmetic and console line formatting.

use std::time::Duration;

use serde::{Serialize, Serializer};

/// Outcome of one executed phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseResult {
    /// 1-based position in the phase table.
    pub seq: usize,
    pub name: String,
    pub passed: bool,
    /// Failure message; empty on pass.
    pub message: String,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// Totals for a finished (or fail-fast stopped) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub declared_total: usize,
    pub recorded: usize,
    pub passed: usize,
    /// Phases never reached because an earlier phase failed.
    pub skipped: usize,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl Summary {
    /// The run succeeds iff every recorded phase passed.
    pub fn success(&self) -> bool {
        self.passed == self.recorded
    }
}

pub fn summarize(results: &[PhaseResult], declared_total: usize, elapsed: Duration) -> Summary {
    Summary {
        declared_total,
        recorded: results.len(),
        passed: results.iter().filter(|r| r.passed).count(),
        skipped: declared_total.saturating_sub(results.len()),
        elapsed,
    }
}

/// `850ms` below one second, `12.3s` above.
pub fn format_duration(duration: Duration) -> String {
    if duration < Duration::from_secs(1) {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

/// `[PASS|FAIL] NN name (duration)[ — message]`
pub fn format_phase_line(result: &PhaseResult) -> String {
    let verdict = if result.passed { "PASS" } else { "FAIL" };
    let mut line = format!(
        "[{verdict}] {:02} {} ({})",
        result.seq,
        result.name,
        format_duration(result.duration)
    );
    if !result.passed && !result.message.is_empty() {
        line.push_str(" — ");
        line.push_str(&result.message);
    }
    line
}

/// `=== Results: passed/total[, K skipped (earlier failure)] — total duration ===`
pub fn format_summary_line(summary: &Summary) -> String {
    let mut line = format!("=== Results: {}/{} passed", summary.passed, summary.declared_total);
    if summary.skipped > 0 {
        line.push_str(&format!(", {} skipped (earlier failure)", summary.skipped));
    }
    line.push_str(&format!(" — total {} ===", format_duration(summary.elapsed)));
    line
}
