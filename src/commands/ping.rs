use anyhow::Result;
use colored::Colorize;
use serde_json::json;
use std::time::Instant;

use crate::output::JsonSuccess;
use crate::session::{guarded, release, Session};

use super::DbContext;

/// Connect, run `SELECT 1`, disconnect.
pub async fn ping(ctx: &mut DbContext<'_>) -> Result<()> {
    let started = Instant::now();
    let mut session = ctx.connect("ping").await?;
    let outcome = guarded(async {
        session
            .execute("SELECT 1")
            .await
            .map_err(anyhow::Error::from)
    })
    .await;
    release(session, outcome).await?;
    let elapsed_ms = started.elapsed().as_millis();

    if ctx.output.is_json() {
        ctx.output.json(&JsonSuccess::new(
            "ping",
            &json!({ "target": ctx.target.display(), "elapsed_ms": elapsed_ms }),
        ))?;
    } else {
        ctx.output.data(&format!(
            "{} {} ({}ms)",
            "OK".green(),
            ctx.target.display(),
            elapsed_ms
        ));
    }
    Ok(())
}
