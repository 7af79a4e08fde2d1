//! Command implementations for sqlmend CLI.
//!
//! Each submodule contains related command functions.

mod migrate;
mod ping;
mod users;

pub use migrate::{migrate_dry_run, migrate_new, migrate_plan, migrate_run};
pub use ping::ping;
pub use users::{dedupe, duplicates, reassign_open_id, set_role, show};

use anyhow::{bail, Result};
use colored::Colorize;
use dialoguer::Confirm;
use serde_json::json;
use std::io::IsTerminal;
use std::time::Duration;

use crate::config::{url_matches_production_patterns, Config};
use crate::connection::ResolvedTarget;
use crate::output::Output;
use crate::report::AuditLog;
use crate::session::MySqlSession;
use crate::users::MySqlUserStore;

/// Everything a database-backed command needs, resolved before connecting.
pub struct DbContext<'a> {
    pub config: &'a Config,
    pub output: &'a Output,
    pub target: ResolvedTarget,
    pub connect_timeout: Duration,
    pub audit: AuditLog,
}

impl DbContext<'_> {
    /// Open the run's single connection.
    pub(crate) async fn connect(&mut self, command: &str) -> Result<MySqlSession> {
        self.output.info(&self.target.banner().dimmed().to_string());
        if url_matches_production_patterns(&self.target.url, self.config) {
            self.output.warn(
                &"WARNING: target matches production patterns"
                    .yellow()
                    .to_string(),
            );
        }

        self.audit.record(
            "run_start",
            json!({
                "command": command,
                "source": self.target.source,
                "user": self.target.user,
            }),
        )?;

        MySqlSession::connect(&self.target.url, self.connect_timeout).await
    }

    pub(crate) async fn connect_users(&mut self, command: &str) -> Result<MySqlUserStore> {
        let session = self.connect(command).await?;
        Ok(MySqlUserStore::new(session, &self.config.users_table()))
    }
}

/// Ask before mutating data. `--yes` skips the prompt; without a terminal it is required.
pub(crate) fn confirm(output: &Output, prompt: &str, yes: bool) -> Result<bool> {
    if yes {
        return Ok(true);
    }
    if output.is_json() || !std::io::stdin().is_terminal() {
        bail!("Refusing to modify data without confirmation. Re-run with --yes.");
    }
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}
