//! Per-instance probe results and their reductions.

use serde::Serialize;

/// Outcome of one probe against one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub label: String,
    pub ok: bool,
    pub message: String,
}

impl ProbeResult {
    pub fn from_outcome(label: &str, outcome: Result<(), String>) -> Self {
        match outcome {
            Ok(()) => Self {
                label: label.to_string(),
                ok: true,
                message: String::new(),
            },
            Err(message) => Self {
                label: label.to_string(),
                ok: false,
                message,
            },
        }
    }
}

/// Order results ascending by instance label.
pub fn sort_by_label(results: &mut [ProbeResult]) {
    results.sort_by(|a, b| a.label.cmp(&b.label));
}

/// Logical AND over the success flags.
pub fn all_ok(results: &[ProbeResult]) -> bool {
    results.iter().all(|result| result.ok)
}

/// Failing entries only, each as `[label] message`, joined with ` | `.
pub fn failure_summary(results: &[ProbeResult]) -> String {
    results
        .iter()
        .filter(|result| !result.ok)
        .map(|result| format!("[{}] {}", result.label, result.message))
        .collect::<Vec<_>>()
        .join(" | ")
}
