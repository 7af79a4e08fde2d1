//! Output layer for sqlmend CLI.
//!
//! Centralizes stdout/stderr separation and human vs JSON output modes.
//! - stdout: data (statement outcomes, row tables, JSON)
//! - stderr: diagnostics (connection banner, progress, warnings, human-mode errors)

use serde::Serialize;

/// Tool version reported in JSON envelopes
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Output mode for the CLI
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputMode {
    Human,
    Json,
}

/// Output helper that centralizes all CLI output
#[derive(Debug, Clone)]
pub struct Output {
    pub mode: OutputMode,
    pub quiet: bool,
    pub verbose: bool,
}

impl Output {
    pub fn new(json: bool, quiet: bool, verbose: bool) -> Self {
        Self {
            mode: if json {
                OutputMode::Json
            } else {
                OutputMode::Human
            },
            quiet,
            verbose,
        }
    }

    /// Write data to stdout unless --quiet is set.
    /// Callers in JSON mode use `json` instead.
    pub fn data(&self, message: &str) {
        if self.quiet {
            return;
        }
        println!("{}", message);
    }

    /// Write JSON data to stdout
    pub fn json<T: Serialize>(&self, data: &T) -> Result<(), serde_json::Error> {
        let json = serde_json::to_string_pretty(data)?;
        println!("{}", json);
        Ok(())
    }

    /// Write a diagnostic/progress message to stderr
    /// Suppressed in JSON mode and when --quiet is set
    pub fn info(&self, message: &str) {
        if self.mode == OutputMode::Json || self.quiet {
            return;
        }
        eprintln!("{}", message);
    }

    /// Write a verbose diagnostic message to stderr
    /// Only shown with --verbose in human mode
    pub fn verbose(&self, message: &str) {
        if self.mode == OutputMode::Json || self.quiet || !self.verbose {
            return;
        }
        eprintln!("{}", message);
    }

    /// Write a warning to stderr
    /// Shown in human mode unless --quiet, suppressed in JSON mode
    pub fn warn(&self, message: &str) {
        if self.mode == OutputMode::Json || self.quiet {
            return;
        }
        eprintln!("{}", message);
    }

    /// Check if we're in JSON mode
    pub fn is_json(&self) -> bool {
        self.mode == OutputMode::Json
    }

    /// Whether human-readable data should be printed
    pub fn is_human(&self) -> bool {
        self.mode == OutputMode::Human && !self.quiet
    }
}

// =============================================================================
// JSON Response Types
// =============================================================================

/// JSON error envelope (written to stdout with non-zero exit).
#[derive(Debug, Serialize)]
pub struct JsonError {
    pub ok: bool,
    pub tool_version: &'static str,
    pub generated_at: String,
    pub error: JsonErrorInfo,
}

#[derive(Debug, Serialize)]
pub struct JsonErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<Vec<crate::report::Check>>,
}

impl JsonError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            tool_version: TOOL_VERSION,
            generated_at: chrono::Utc::now().to_rfc3339(),
            error: JsonErrorInfo {
                message: message.into(),
                details: None,
                checks: None,
            },
        }
    }

    pub fn with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        let mut err = Self::new(message);
        err.error.details = Some(details.into());
        err
    }

    pub fn with_checks(mut self, checks: Vec<crate::report::Check>) -> Self {
        self.error.checks = Some(checks);
        self
    }

    /// Print this error as JSON to stdout
    pub fn print(&self) {
        match serde_json::to_string_pretty(self) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{{\"ok\":false}}"),
        }
    }
}

/// JSON success wrapper: `{"ok": true, ...payload}`
#[derive(Debug, Serialize)]
pub struct JsonSuccess<'a, T: Serialize> {
    pub ok: bool,
    pub command: &'a str,
    #[serde(flatten)]
    pub data: &'a T,
}

impl<'a, T: Serialize> JsonSuccess<'a, T> {
    pub fn new(command: &'a str, data: &'a T) -> Self {
        Self {
            ok: true,
            command,
            data,
        }
    }
}
