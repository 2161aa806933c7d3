//! Machine-readable run report, persisted as JSON.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::report::{PhaseResult, Summary};

/// Everything needed to judge a run without re-reading the console.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub host: &'a str,
    pub user: &'a str,
    pub start_time: String,
    pub end_time: String,
    pub success: bool,
    pub summary: Summary,
    pub phases: &'a [PhaseResult],
}

impl<'a> RunReport<'a> {
    pub fn new(
        host: &'a str,
        user: &'a str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        summary: Summary,
        phases: &'a [PhaseResult],
    ) -> Self {
        Self {
            host,
            user,
            start_time: started_at.to_rfc3339(),
            end_time: finished_at.to_rfc3339(),
            success: summary.success(),
            summary,
            phases,
        }
    }
}

/// Atomically write the report (temp file + rename).
pub fn write_report(path: &Path, report: &RunReport<'_>) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(report).context("serialize report")?;
    payload.push('\n');
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("write temp report {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace report {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::summarize;
    use serde_json::Value;
    use std::time::Duration;

    #[test]
    fn writes_summary_and_phases() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("reports/run.json");
        let phases = vec![
            PhaseResult {
                seq: 1,
                name: "upload".to_string(),
                passed: true,
                message: String::new(),
                duration: Duration::from_millis(120),
            },
            PhaseResult {
                seq: 2,
                name: "gen-env A".to_string(),
                passed: false,
                message: "boom".to_string(),
                duration: Duration::from_millis(30),
            },
        ];
        let summary = summarize(&phases, 5, Duration::from_secs(2));
        let now = Utc::now();
        let report = RunReport::new("10.0.0.5", "ops", now, now, summary, &phases);

        write_report(&path, &report).expect("write");

        let value: Value =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["success"], Value::Bool(false));
        assert_eq!(value["summary"]["skipped"], 3);
        assert_eq!(value["summary"]["elapsed_ms"], 2000);
        assert_eq!(value["phases"][1]["message"], "boom");
        assert_eq!(value["phases"][0]["duration_ms"], 120);
        assert!(!temp.path().join("reports/run.json.tmp").exists());
    }
}
