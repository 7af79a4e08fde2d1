//! Account repair commands for sqlmend CLI.

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;
use serde_json::json;

use crate::output::{JsonSuccess, Output};
use crate::report::{render_table, AuditLog, Check, PostconditionFailed};
use crate::session::{guarded, release};
use crate::users::{
    apply_dedupe, apply_reassign_open_id, apply_set_role, find_users, plan_dedupe,
    plan_reassign_open_id, plan_set_role, render_users, Applied, DedupeRequest, DuplicateField,
    Role, UserRecord, UserSelector, UserStore,
};

use super::{confirm, DbContext};

#[derive(Serialize)]
struct RepairResponse<'a, P: Serialize> {
    dry_run: bool,
    plan: &'a P,
    #[serde(skip_serializing_if = "Option::is_none")]
    applied: Option<&'a Applied>,
}

pub async fn show(ctx: &mut DbContext<'_>, selector: &UserSelector) -> Result<()> {
    let mut store = ctx.connect_users("users show").await?;
    let outcome = guarded(find_users(&mut store, selector)).await;
    let users = release(store, outcome).await?;

    let output = ctx.output;
    if output.is_json() {
        output.json(&JsonSuccess::new("users show", &json!({ "users": users })))?;
    } else if users.is_empty() {
        output.data(&format!("No users found with {}", selector).yellow().to_string());
    } else {
        output.data(render_users(&users).trim_end());
    }
    Ok(())
}

pub async fn duplicates(ctx: &mut DbContext<'_>) -> Result<()> {
    let mut store = ctx.connect_users("users duplicates").await?;
    let outcome = guarded(crate::users::duplicates(&mut store)).await;
    let groups = release(store, outcome).await?;

    let output = ctx.output;
    if output.is_json() {
        output.json(&JsonSuccess::new(
            "users duplicates",
            &json!({ "groups": groups }),
        ))?;
    } else if groups.is_empty() {
        output.data(&"No duplicate emails or OpenIDs".green().to_string());
    } else {
        let rows: Vec<Vec<Option<String>>> = groups
            .iter()
            .map(|g| {
                let field = match g.field {
                    DuplicateField::Email => "email",
                    DuplicateField::OpenId => "openId",
                };
                let ids: Vec<String> = g.ids.iter().map(|id| id.to_string()).collect();
                vec![
                    Some(field.to_string()),
                    Some(g.value.clone()),
                    Some(ids.join(", ")),
                ]
            })
            .collect();
        output.data(render_table(&["field", "value", "ids"], &rows).trim_end());
    }
    Ok(())
}

pub async fn dedupe(ctx: &mut DbContext<'_>, req: &DedupeRequest, dry_run: bool, yes: bool) -> Result<()> {
    let output = ctx.output;
    let mut store = ctx.connect_users("users dedupe").await?;
    let outcome = guarded(dedupe_work(&mut store, output, &mut ctx.audit, req, dry_run, yes)).await;
    release(store, outcome).await
}

async fn dedupe_work<S: UserStore>(
    store: &mut S,
    output: &Output,
    audit: &mut AuditLog,
    req: &DedupeRequest,
    dry_run: bool,
    yes: bool,
) -> Result<()> {
    let plan = plan_dedupe(store, req).await?;
    let before = plan.before();
    audit.record("repair_planned", json!({ "operation": "dedupe", "plan": plan }))?;

    if output.is_human() {
        print_before(output, &before);
        output.data(&format!("Keep id {}", plan.keep.id.to_string().bold()));
        if !plan.delete.is_empty() {
            let ids: Vec<String> = plan.delete.iter().map(|u| u.id.to_string()).collect();
            output.data(&format!("Delete id(s) {}", ids.join(", ").red()));
        }
        if let Some(ref email) = plan.update.email {
            output.data(&format!("Set email on id {} to {}", plan.keep.id, email));
        }
        if let Some(ref open_id) = plan.update.open_id {
            output.data(&format!("Set OpenID on id {} to {}", plan.keep.id, open_id));
        }
    }

    let applied = if proceed(output, plan.is_noop(), dry_run, yes)? {
        let result = apply_dedupe(store, &plan).await;
        Some(audited(audit, "dedupe", &before, result)?)
    } else {
        None
    };
    respond(output, "users dedupe", dry_run, &plan, applied.as_ref())
}

pub async fn reassign_open_id(
    ctx: &mut DbContext<'_>,
    id: i64,
    open_id: &str,
    dry_run: bool,
    yes: bool,
) -> Result<()> {
    let output = ctx.output;
    let mut store = ctx.connect_users("users reassign-openid").await?;
    let outcome = guarded(reassign_work(&mut store, output, &mut ctx.audit, id, open_id, dry_run, yes)).await;
    release(store, outcome).await
}

async fn reassign_work<S: UserStore>(
    store: &mut S,
    output: &Output,
    audit: &mut AuditLog,
    id: i64,
    open_id: &str,
    dry_run: bool,
    yes: bool,
) -> Result<()> {
    let plan = plan_reassign_open_id(store, id, open_id).await?;
    let before = vec![plan.user.clone()];
    audit.record(
        "repair_planned",
        json!({ "operation": "reassign_open_id", "plan": plan }),
    )?;

    if output.is_human() {
        print_before(output, &before);
        output.data(&format!(
            "Set OpenID on id {}: {} -> {}",
            plan.user.id,
            plan.user.open_id.as_deref().unwrap_or("NULL"),
            plan.open_id.bold()
        ));
    }

    let applied = if proceed(output, plan.is_noop(), dry_run, yes)? {
        let result = apply_reassign_open_id(store, &plan).await;
        Some(audited(audit, "reassign_open_id", &before, result)?)
    } else {
        None
    };
    respond(output, "users reassign-openid", dry_run, &plan, applied.as_ref())
}

pub async fn set_role(
    ctx: &mut DbContext<'_>,
    selector: &UserSelector,
    role: Role,
    dry_run: bool,
    yes: bool,
) -> Result<()> {
    let output = ctx.output;
    let mut store = ctx.connect_users("users set-role").await?;
    let outcome = guarded(set_role_work(&mut store, output, &mut ctx.audit, selector, role, dry_run, yes)).await;
    release(store, outcome).await
}

async fn set_role_work<S: UserStore>(
    store: &mut S,
    output: &Output,
    audit: &mut AuditLog,
    selector: &UserSelector,
    role: Role,
    dry_run: bool,
    yes: bool,
) -> Result<()> {
    let plan = plan_set_role(store, selector, role).await?;
    let before = vec![plan.user.clone()];
    audit.record("repair_planned", json!({ "operation": "set_role", "plan": plan }))?;

    if output.is_human() {
        print_before(output, &before);
        output.data(&format!(
            "Set role on id {}: {} -> {}",
            plan.user.id,
            plan.user.role,
            plan.role.as_str().bold()
        ));
    }

    let applied = if proceed(output, plan.is_noop(), dry_run, yes)? {
        let result = apply_set_role(store, &plan).await;
        Some(audited(audit, "set_role", &before, result)?)
    } else {
        None
    };
    respond(output, "users set-role", dry_run, &plan, applied.as_ref())
}

fn print_before(output: &Output, before: &[UserRecord]) {
    output.data(&"Before:".bold().to_string());
    output.data(render_users(before).trim_end());
    output.data("");
}

/// Decide whether to apply a planned repair.
fn proceed(output: &Output, noop: bool, dry_run: bool, yes: bool) -> Result<bool> {
    if noop {
        output.info(&"Nothing to do: already in the requested state.".green().to_string());
        return Ok(false);
    }
    if dry_run {
        output.info(&"Dry run: no changes made.".blue().to_string());
        return Ok(false);
    }
    if !confirm(output, "Apply these changes?", yes)? {
        output.info("Aborted.");
        return Ok(false);
    }
    Ok(true)
}

/// Record the repair outcome in the audit log and pass it through.
fn audited(
    audit: &mut AuditLog,
    operation: &str,
    before: &[UserRecord],
    result: Result<Applied>,
) -> Result<Applied> {
    match &result {
        Ok(applied) => audit.record(
            "repair_applied",
            json!({
                "operation": operation,
                "before": before,
                "after": applied.after,
                "checks": applied.checks,
            }),
        )?,
        Err(err) => {
            let checks: Option<Vec<Check>> = err
                .downcast_ref::<PostconditionFailed>()
                .map(|f| f.checks.clone());
            // The repair error is what gets reported; an audit write failure here is secondary.
            let _ = audit.record(
                "repair_failed",
                json!({
                    "operation": operation,
                    "before": before,
                    "error": format!("{:#}", err),
                    "checks": checks,
                }),
            );
        }
    }
    result
}

fn respond<P: Serialize>(
    output: &Output,
    command: &str,
    dry_run: bool,
    plan: &P,
    applied: Option<&Applied>,
) -> Result<()> {
    if output.is_json() {
        output.json(&JsonSuccess::new(
            command,
            &RepairResponse {
                dry_run,
                plan,
                applied,
            },
        ))?;
        return Ok(());
    }

    if let Some(applied) = applied {
        output.data("");
        output.data(&"After:".bold().to_string());
        output.data(render_users(&applied.after).trim_end());
        output.data("");
        for check in &applied.checks {
            output.data(&format!(
                "  {} {}: {}",
                "ok".green(),
                check.name,
                check.actual
            ));
        }
        output.data(&"Committed.".green().to_string());
    }
    Ok(())
}
