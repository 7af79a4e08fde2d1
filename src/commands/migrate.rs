//! Migration commands for sqlmend CLI.

use anyhow::{Context, Result};
use colored::Colorize;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};

use crate::artifacts::{discover, load_artifact, new_artifact, Artifact};
use crate::config::Config;
use crate::executor::{apply_batch, BatchReport, Outcome, StatementResult};
use crate::output::{JsonSuccess, Output};
use crate::redact::redact_query;
use crate::report::AuditLog;
use crate::sequencer::{describe, split_statements, StatementKind};
use crate::session::{guarded, release, Session};

use super::DbContext;

#[derive(Debug, Serialize)]
struct PlannedStatement {
    position: usize,
    kind: StatementKind,
    statement: String,
}

#[derive(Debug, Serialize)]
struct ArtifactPlan {
    artifact: String,
    checksum: String,
    statements: Vec<PlannedStatement>,
}

#[derive(Debug, Serialize)]
struct ArtifactRun {
    artifact: String,
    checksum: String,
    #[serde(flatten)]
    report: BatchReport,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    artifacts: Vec<ArtifactRun>,
    applied: usize,
    already_applied: usize,
}

fn plan_artifact(artifact: &Artifact) -> ArtifactPlan {
    let statements = split_statements(&artifact.sql)
        .into_iter()
        .enumerate()
        .map(|(i, statement)| PlannedStatement {
            position: i + 1,
            kind: describe(&statement),
            statement,
        })
        .collect();
    ArtifactPlan {
        artifact: artifact.name.clone(),
        checksum: artifact.checksum.clone(),
        statements,
    }
}

fn print_plan(plan: &ArtifactPlan, output: &Output) {
    output.data(&format!(
        "{} ({} statement(s))",
        plan.artifact.bold(),
        plan.statements.len()
    ));
    for s in &plan.statements {
        let kind = if s.kind.is_schema_change() {
            s.kind.label().cyan()
        } else {
            s.kind.label().normal()
        };
        output.data(&format!("  {:>3}. [{}] {}", s.position, kind, s.statement));
    }
}

/// Resolve the artifacts for `migrate run`: explicit files, or the whole directory.
fn collect_artifacts(files: &[PathBuf], config: &Config) -> Result<Vec<Artifact>> {
    if files.is_empty() {
        discover(Path::new(config.migrations_dir()))
    } else {
        files.iter().map(|f| load_artifact(f)).collect()
    }
}

/// Show the statements an artifact would run, without connecting.
pub fn migrate_plan(file: &Path, output: &Output) -> Result<()> {
    let artifact = load_artifact(file)?;
    let plan = plan_artifact(&artifact);

    if output.is_json() {
        output.json(&JsonSuccess::new("migrate plan", &plan))?;
        return Ok(());
    }

    print_plan(&plan, output);
    if plan.statements.is_empty() {
        output.warn(&"No statements found.".yellow().to_string());
    }
    Ok(())
}

pub fn migrate_new(name: &str, config: &Config, output: &Output) -> Result<()> {
    let path = new_artifact(Path::new(config.migrations_dir()), name)?;
    if output.is_json() {
        output.json(&JsonSuccess::new(
            "migrate new",
            &json!({ "path": path.display().to_string() }),
        ))?;
    } else {
        output.data(&format!("Created: {}", path.display().to_string().green()));
    }
    Ok(())
}

/// Print what `migrate run` would execute, without connecting.
pub fn migrate_dry_run(files: &[PathBuf], config: &Config, output: &Output) -> Result<()> {
    let artifacts = collect_artifacts(files, config)?;
    let plans: Vec<ArtifactPlan> = artifacts.iter().map(plan_artifact).collect();

    if output.is_json() {
        output.json(&JsonSuccess::new(
            "migrate run",
            &json!({ "dry_run": true, "artifacts": plans }),
        ))?;
        return Ok(());
    }

    if plans.is_empty() {
        output.data(&"No migration artifacts found".green().to_string());
        return Ok(());
    }
    for plan in &plans {
        print_plan(plan, output);
    }
    output.data(&"\nDry run complete. No changes made.".blue().to_string());
    Ok(())
}

/// Run migration artifacts in order through the guarded executor.
///
/// The first fatal statement stops the run: later statements and later
/// artifacts are not attempted.
pub async fn migrate_run(ctx: &mut DbContext<'_>, files: &[PathBuf]) -> Result<()> {
    let output = ctx.output;
    let artifacts = collect_artifacts(files, ctx.config)?;

    if artifacts.is_empty() {
        if output.is_json() {
            output.json(&JsonSuccess::new(
                "migrate run",
                &RunSummary {
                    artifacts: Vec::new(),
                    applied: 0,
                    already_applied: 0,
                },
            ))?;
        } else {
            output.data(&"No migration artifacts found".green().to_string());
        }
        return Ok(());
    }

    let mut session = ctx.connect("migrate run").await?;
    let outcome = guarded(run_artifacts(&mut session, &artifacts, output, &mut ctx.audit)).await;
    let summary = release(session, outcome).await?;

    if output.is_json() {
        output.json(&JsonSuccess::new("migrate run", &summary))?;
    } else {
        output.data(
            &format!(
                "\nDone: {} applied, {} already applied.",
                summary.applied, summary.already_applied
            )
            .green()
            .to_string(),
        );
    }
    Ok(())
}

async fn run_artifacts<S: Session>(
    session: &mut S,
    artifacts: &[Artifact],
    output: &Output,
    audit: &mut AuditLog,
) -> Result<RunSummary> {
    let mut summary = RunSummary {
        artifacts: Vec::with_capacity(artifacts.len()),
        applied: 0,
        already_applied: 0,
    };

    for artifact in artifacts {
        let statements = split_statements(&artifact.sql);
        if output.is_human() {
            output.data(&format!(
                "{} ({} statement(s))",
                artifact.name.bold(),
                statements.len()
            ));
        }
        audit.record(
            "artifact_start",
            json!({
                "artifact": artifact.name,
                "path": artifact.path.display().to_string(),
                "checksum": artifact.checksum,
                "statements": statements.len(),
            }),
        )?;

        let total = statements.len();
        let report = apply_batch(session, &statements, |r| print_result(output, r, total)).await;

        for result in &report.results {
            audit.record(
                "statement",
                json!({
                    "artifact": artifact.name,
                    "position": result.position,
                    "kind": result.kind,
                    "statement": redact_query(&result.statement),
                    "outcome": result.outcome,
                }),
            )?;
        }

        audit.record(
            "artifact_end",
            json!({
                "artifact": artifact.name,
                "ok": report.is_success(),
                "applied": report.applied,
                "already_applied": report.already_applied,
                "not_attempted": report.not_attempted,
            }),
        )?;

        summary.applied += report.applied;
        summary.already_applied += report.already_applied;
        report
            .ensure_success()
            .with_context(|| format!("Migration {} aborted", artifact.name))?;
        summary.artifacts.push(ArtifactRun {
            artifact: artifact.name.clone(),
            checksum: artifact.checksum.clone(),
            report,
        });
    }

    Ok(summary)
}

fn print_result(output: &Output, result: &StatementResult, total: usize) {
    if !output.is_human() {
        return;
    }
    let head = format!("[{}/{}] {}", result.position, total, result.kind.label());
    let line = match &result.outcome {
        Outcome::Applied { rows_affected } => format!(
            "  {} {} ({} row(s))",
            "applied".green(),
            head,
            rows_affected
        ),
        Outcome::AlreadyApplied { reason, .. } => format!(
            "  {} {} ({})",
            "skipped".yellow(),
            head,
            reason
        ),
        Outcome::Failed { error, .. } => format!("  {} {}: {}", "failed".red(), head, error),
    };
    output.data(&line);
    output.verbose(&format!("      {}", redact_query(&result.statement)));
}
