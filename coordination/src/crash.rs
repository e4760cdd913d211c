//! Crash reports written when a cluster sends a panic report.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde_json::Value;

/// File name for a crash report, e.g. `Cluster A crash at 2021-5-29 1304.log`.
pub fn report_file_name(identifier: &str, at: DateTime<Utc>) -> String {
    format!(
        "Cluster {} crash at {}-{}-{} {:02}{:02}.log",
        identifier,
        at.year(),
        at.month(),
        at.day(),
        at.hour(),
        at.minute()
    )
}

/// Write the reported error and traceback under `dir`, returning the path.
pub async fn write_report(
    dir: &Path,
    identifier: &str,
    error: Option<&Value>,
    traceback: Option<&Value>,
) -> std::io::Result<PathBuf> {
    let path = dir.join(report_file_name(identifier, Utc::now()));
    let body = format!("{}\n{}", render_field(error), render_field(traceback));
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

/// Text form of an optional report field: strings verbatim, other JSON
/// values serialized, absent fields as `None`.
pub(crate) fn render_field(value: Option<&Value>) -> String {
    match value {
        None => "None".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
