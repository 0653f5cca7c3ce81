//! Machine-readable iteration records and log file placement.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

use crate::core::types::IterationResult;

/// One line of `<log>.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord<'a> {
    pub recorded_at: String,
    pub commit_detected: bool,
    pub marker_without_commit: bool,
    #[serde(flatten)]
    pub result: &'a IterationResult,
}

/// Default durable log: `<tmp>/ralph_<workdir>_<YYYYmmdd_HHMMSS>_iteration.log`.
pub fn default_log_path(workdir: &Path, now: DateTime<Local>) -> PathBuf {
    let base = workdir
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "workspace".to_string());
    std::env::temp_dir().join(format!(
        "ralph_{base}_{}_iteration.log",
        now.format("%Y%m%d_%H%M%S")
    ))
}

/// Records live next to the durable log with a `.jsonl` suffix appended.
pub fn records_path(log_path: &Path) -> PathBuf {
    let mut name = OsString::from(log_path.as_os_str());
    name.push(".jsonl");
    PathBuf::from(name)
}

/// Append one record as a single JSON line.
pub fn append_record(path: &Path, record: &IterationRecord<'_>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create record dir {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serialize iteration record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open iteration records {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append iteration record {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::Value;

    use crate::core::types::FailureKind;
    use crate::test_support::sample_result;

    #[test]
    fn default_log_path_uses_workdir_name_and_stamp() {
        let now = Local
            .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("valid time");
        let path = default_log_path(Path::new("/home/dev/my-app"), now);
        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("ralph_my-app_20260304_050607_iteration.log")
        );
    }

    #[test]
    fn records_path_appends_suffix() {
        assert_eq!(
            records_path(Path::new("/tmp/run_iteration.log")),
            PathBuf::from("/tmp/run_iteration.log.jsonl")
        );
    }

    #[test]
    fn append_writes_one_json_line_per_record() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("run.log.jsonl");
        let first = sample_result(1, Some(FailureKind::TimeoutExceeded));
        let second = sample_result(2, None);
        for (result, commit) in [(&first, false), (&second, true)] {
            append_record(
                &path,
                &IterationRecord {
                    recorded_at: "now".to_string(),
                    commit_detected: commit,
                    marker_without_commit: false,
                    result,
                },
            )
            .expect("append");
        }
        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["iteration"], 1);
        assert_eq!(lines[0]["failure"], "TimeoutExceeded");
        assert_eq!(lines[1]["commit_detected"], true);
    }
}
