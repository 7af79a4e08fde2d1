//! Verification reporting: row tables for operators, post-condition checks
//! for automation and a JSON-lines audit trail for both.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Render rows as an aligned text table. Missing values print as NULL.
pub fn render_table(columns: &[&str], rows: &[Vec<Option<String>>]) -> String {
    if columns.is_empty() {
        return String::new();
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(widths.len()) {
            let s = cell.as_deref().unwrap_or("NULL");
            widths[i] = widths[i].max(s.chars().count());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:width$}", c, width = widths[i]))
        .collect();
    out.push_str(header.join(" | ").trim_end());
    out.push('\n');

    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&sep.join("-+-"));
    out.push('\n');

    for row in rows {
        let line: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let s = row.get(i).and_then(|v| v.as_deref()).unwrap_or("NULL");
                format!("{:width$}", s, width = widths[i])
            })
            .collect();
        out.push_str(line.join(" | ").trim_end());
        out.push('\n');
    }

    out
}

/// One verified expectation about the database state after a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Check {
    pub name: String,
    pub expected: String,
    pub actual: String,
    pub passed: bool,
}

impl Check {
    pub fn expect_eq<T: fmt::Display + PartialEq>(name: &str, expected: T, actual: T) -> Self {
        Self {
            name: name.to_string(),
            passed: expected == actual,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Displays `Option<&str>` values as the literal or NULL.
pub fn or_null(value: Option<&str>) -> String {
    value.unwrap_or("NULL").to_string()
}

/// Post-conditions that did not hold. The change has been rolled back.
#[derive(Debug, Clone)]
pub struct PostconditionFailed {
    pub checks: Vec<Check>,
}

impl fmt::Display for PostconditionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let failed: Vec<String> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{} (expected {}, got {})", c.name, c.expected, c.actual))
            .collect();
        write!(
            f,
            "Post-condition check failed, changes rolled back: {}",
            failed.join("; ")
        )
    }
}

impl std::error::Error for PostconditionFailed {}

/// Return the checks if all passed, otherwise the failure.
pub fn verify(checks: Vec<Check>) -> Result<Vec<Check>, PostconditionFailed> {
    if checks.iter().all(|c| c.passed) {
        Ok(checks)
    } else {
        Err(PostconditionFailed { checks })
    }
}

/// Append-only JSON-lines audit trail for one run.
///
/// Every record carries the timestamp, run id, event name and redacted target.
pub struct AuditLog {
    sink: Option<Box<dyn Write + Send>>,
    run_id: String,
    target: String,
}

impl AuditLog {
    pub fn disabled() -> Self {
        Self {
            sink: None,
            run_id: new_run_id(),
            target: String::new(),
        }
    }

    /// Open (or create) `path` for appending.
    pub fn open(path: &Path, target: &str) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))?;
        Ok(Self::to_writer(file, target))
    }

    pub fn to_writer(writer: impl Write + Send + 'static, target: &str) -> Self {
        Self {
            sink: Some(Box::new(writer)),
            run_id: new_run_id(),
            target: target.to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Write one record. Object fields of `data` are merged into the line.
    pub fn record(&mut self, event: &str, data: Value) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };

        let mut line = serde_json::Map::new();
        line.insert("ts".into(), json!(Utc::now().to_rfc3339()));
        line.insert("run_id".into(), json!(self.run_id));
        line.insert("event".into(), json!(event));
        line.insert("target".into(), json!(self.target));
        match data {
            Value::Object(fields) => line.extend(fields),
            Value::Null => {}
            other => {
                line.insert("data".into(), other);
            }
        }

        writeln!(sink, "{}", Value::Object(line)).context("Failed to write audit log")?;
        sink.flush().context("Failed to write audit log")?;
        Ok(())
    }
}

fn new_run_id() -> String {
    format!(
        "{}-{}",
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ"),
        std::process::id()
    )
}
