//! Guarded executor: runs a statement batch in order against one session.
//!
//! Failures that mean "this change is already in place" (table exists,
//! duplicate column, duplicate index) are recorded and skipped, which is what
//! makes re-running a migration safe. Any other failure stops the batch. There
//! is no wrapping transaction: statements before the failure stay applied and
//! statements after it are never attempted.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::sequencer::{describe, StatementKind};
use crate::session::{DbError, Session};

/// ER_TABLE_EXISTS_ERROR
pub const ER_TABLE_EXISTS: u16 = 1050;
/// ER_DUP_FIELDNAME
pub const ER_DUP_FIELDNAME: u16 = 1060;
/// ER_DUP_KEYNAME
pub const ER_DUP_KEYNAME: u16 = 1061;

/// How a failed statement affects the rest of the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The requested change already exists; continue with the next statement.
    AlreadyApplied(&'static str),
    /// Abort the remaining statements.
    Fatal,
}

/// Classify a database error.
///
/// Server errors are classified by error number only. The message fallback is
/// reserved for errors that lost their number on the way (proxies, wrapped
/// client errors).
pub fn classify(err: &DbError) -> ErrorClass {
    match err.number {
        Some(ER_TABLE_EXISTS) => ErrorClass::AlreadyApplied("table already exists"),
        Some(ER_DUP_FIELDNAME) => ErrorClass::AlreadyApplied("duplicate column"),
        Some(ER_DUP_KEYNAME) => ErrorClass::AlreadyApplied("duplicate index"),
        Some(_) => ErrorClass::Fatal,
        None => {
            let message = err.message.to_lowercase();
            if message.contains("duplicate column name") {
                ErrorClass::AlreadyApplied("duplicate column")
            } else if message.contains("duplicate key name") {
                ErrorClass::AlreadyApplied("duplicate index")
            } else if message.contains("table") && message.contains("already exists") {
                ErrorClass::AlreadyApplied("table already exists")
            } else {
                ErrorClass::Fatal
            }
        }
    }
}

/// Outcome of one statement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Applied {
        rows_affected: u64,
    },
    AlreadyApplied {
        reason: &'static str,
        message: String,
    },
    Failed {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        error: String,
    },
}

/// One executed statement and what happened to it
#[derive(Debug, Clone, Serialize)]
pub struct StatementResult {
    /// 1-based position in the batch
    pub position: usize,
    pub kind: StatementKind,
    pub statement: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Result of running a whole batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub applied: usize,
    pub already_applied: usize,
    pub not_attempted: usize,
    pub results: Vec<StatementResult>,
}

impl BatchReport {
    fn new(total: usize) -> Self {
        Self {
            total,
            applied: 0,
            already_applied: 0,
            not_attempted: 0,
            results: Vec::with_capacity(total),
        }
    }

    /// The statement that aborted the batch, if any
    pub fn failure(&self) -> Option<&StatementResult> {
        self.results
            .iter()
            .find(|r| matches!(r.outcome, Outcome::Failed { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failure().is_none()
    }

    /// Convert a failed batch into an error for the caller.
    pub fn ensure_success(&self) -> Result<()> {
        if let Some(failed) = self.failure() {
            let error = match &failed.outcome {
                Outcome::Failed { error, .. } => error.as_str(),
                _ => "",
            };
            bail!(
                "Statement {} of {} failed: {}\n  {}\n{} statement(s) applied before the failure remain applied; {} not attempted. Fix the cause and re-run.",
                failed.position,
                self.total,
                error,
                crate::redact::redact_query(&failed.statement),
                self.applied + self.already_applied,
                self.not_attempted
            );
        }
        Ok(())
    }
}

/// Execute `statements` in order, calling `observer` after each one.
///
/// Never returns early with an error: a fatal failure is recorded in the
/// report and the remaining statements are counted as not attempted.
pub async fn apply_batch<S, F>(
    session: &mut S,
    statements: &[String],
    mut observer: F,
) -> BatchReport
where
    S: Session,
    F: FnMut(&StatementResult),
{
    let mut report = BatchReport::new(statements.len());

    for (idx, statement) in statements.iter().enumerate() {
        let outcome = match session.execute(statement).await {
            Ok(rows_affected) => {
                report.applied += 1;
                Outcome::Applied { rows_affected }
            }
            Err(err) => match classify(&err) {
                ErrorClass::AlreadyApplied(reason) => {
                    report.already_applied += 1;
                    Outcome::AlreadyApplied {
                        reason,
                        message: err.message.clone(),
                    }
                }
                ErrorClass::Fatal => Outcome::Failed {
                    code: err.number,
                    error: err.to_string(),
                },
            },
        };

        let fatal = matches!(outcome, Outcome::Failed { .. });
        let result = StatementResult {
            position: idx + 1,
            kind: describe(statement),
            statement: statement.clone(),
            outcome,
        };
        observer(&result);
        report.results.push(result);

        if fatal {
            report.not_attempted = statements.len() - (idx + 1);
            break;
        }
    }

    report
}
