use anyhow::{bail, Context, Result};
use clap::{error::ErrorKind, Args, Parser, Subcommand};
use serde_json::json;
use std::path::{Path, PathBuf};

mod artifacts;
mod commands;
mod config;
mod connection;
mod executor;
mod exit_codes;
mod output;
mod redact;
mod report;
mod sequencer;
mod session;
mod sql;
#[cfg(test)]
mod testing;
mod users;

use commands::DbContext;
use config::Config;
use output::{JsonError, Output};
use report::{AuditLog, PostconditionFailed};
use users::{DedupeRequest, KeepPolicy, Role, UserSelector};

/// Version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "sqlmend")]
#[command(version = VERSION)]
#[command(
    about = "Idempotent MySQL migrations and account repairs",
    long_about = None
)]
#[command(subcommand_required = true, arg_required_else_help = true)]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    /// Path to config file (default: ./sqlmend.toml)
    #[arg(long = "config", global = true)]
    config_path: Option<PathBuf>,

    /// Minimal output (errors only)
    #[arg(long, global = true)]
    quiet: bool,

    /// Show statement text as it executes
    #[arg(long, global = true)]
    verbose: bool,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct TargetArgs {
    /// Database URL (overrides DATABASE_URL env var and config file)
    #[arg(short = 'd', long = "database-url", global = true)]
    database_url: Option<String>,

    /// Named connection from sqlmend.toml [connections] section
    #[arg(short = 'C', long = "connection", global = true)]
    connection: Option<String>,

    /// Environment variable name containing the database URL (e.g., PORTAL_DATABASE_URL)
    #[arg(long = "env", global = true)]
    env_var: Option<String>,

    /// Connection timeout (e.g., 5s, 500ms)
    #[arg(long = "connect-timeout", global = true)]
    connect_timeout: Option<String>,

    /// Append a JSON-lines audit record of this run to the given file
    #[arg(long = "audit-log", global = true)]
    audit_log: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run, inspect or create migration artifacts
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },
    /// Inspect and repair user accounts
    Users {
        #[command(subcommand)]
        command: UsersCommands,
    },
    /// Check that the resolved database is reachable
    Ping,
}

#[derive(Subcommand)]
enum MigrateCommands {
    /// Execute migration artifacts; existing tables, columns and indexes are skipped
    Run {
        /// Artifacts to run, in order (default: every .sql file in the migrations directory)
        files: Vec<PathBuf>,
        /// Show the statements without connecting
        #[arg(long)]
        dry_run: bool,
    },
    /// Show how an artifact splits into statements
    Plan {
        file: PathBuf,
    },
    /// Create a new timestamped migration artifact
    New {
        name: String,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct SelectorArgs {
    /// Select by primary key
    #[arg(long)]
    id: Option<i64>,
    /// Select by email
    #[arg(long)]
    email: Option<String>,
    /// Select by OpenID token
    #[arg(long = "open-id")]
    open_id: Option<String>,
}

impl SelectorArgs {
    fn selector(&self) -> Result<UserSelector> {
        match (self.id, &self.email, &self.open_id) {
            (Some(id), _, _) => Ok(UserSelector::Id(id)),
            (None, Some(email), _) => Ok(UserSelector::Email(email.clone())),
            (None, None, Some(open_id)) => Ok(UserSelector::OpenId(open_id.clone())),
            (None, None, None) => bail!("One of --id, --email or --open-id is required"),
        }
    }
}

#[derive(Subcommand)]
enum UsersCommands {
    /// Show matching user rows
    Show {
        #[command(flatten)]
        selector: SelectorArgs,
    },
    /// List emails and OpenIDs held by more than one row
    Duplicates,
    /// Merge duplicate accounts sharing an email into one canonical row
    Dedupe {
        /// Email shared by the duplicate rows
        #[arg(long)]
        email: String,
        /// Row to keep (default: the lowest id with this email)
        #[arg(long = "keep-id")]
        keep_id: Option<i64>,
        /// OpenID the kept row must end up with
        #[arg(long = "open-id")]
        open_id: Option<String>,
        /// Show the plan without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Move an OpenID token onto a user row
    ReassignOpenid {
        /// User id receiving the token
        #[arg(long)]
        id: i64,
        #[arg(long = "open-id")]
        open_id: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Change a user's role
    SetRole {
        #[command(flatten)]
        selector: SelectorArgs,
        /// superadmin, tenant_admin, staff or client
        #[arg(long)]
        role: Role,
        #[arg(long)]
        dry_run: bool,
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() {
    // Load .env file if present (before parsing CLI so env vars are available)
    let _ = dotenvy::dotenv();

    // Check for --json flag early (before full parsing) for error handling
    let json_mode = std::env::args().any(|arg| arg == "--json");

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let meta = matches!(
                e.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            );
            if json_mode && !meta {
                JsonError::new(e.to_string()).print();
                std::process::exit(exit_codes::USAGE);
            }
            e.exit();
        }
    };

    let output = Output::new(cli.json, cli.quiet, cli.verbose);

    let code = match run(cli, &output).await {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => {
            report_error(&output, &e);
            exit_codes::FAILURE
        }
    };
    std::process::exit(code);
}

fn report_error(output: &Output, e: &anyhow::Error) {
    if output.is_json() {
        let mut json_err = JsonError::with_details(e.to_string(), format!("{e:#}"));
        if let Some(failed) = e.downcast_ref::<PostconditionFailed>() {
            json_err = json_err.with_checks(failed.checks.clone());
        }
        json_err.print();
    } else {
        eprintln!("Error: {e:#}");
    }
}

async fn run(cli: Cli, output: &Output) -> Result<()> {
    let config =
        Config::load(cli.config_path.as_deref()).context("Failed to load configuration")?;
    let target = &cli.target;

    match cli.command {
        Commands::Migrate { command } => match command {
            MigrateCommands::Plan { file } => commands::migrate_plan(&file, output),
            MigrateCommands::New { name } => commands::migrate_new(&name, &config, output),
            MigrateCommands::Run {
                files,
                dry_run: true,
            } => commands::migrate_dry_run(&files, &config, output),
            MigrateCommands::Run {
                files,
                dry_run: false,
            } => {
                let mut ctx = db_context(target, &config, output)?;
                let result = commands::migrate_run(&mut ctx, &files).await;
                finish_run(ctx, result)
            }
        },
        Commands::Ping => {
            let mut ctx = db_context(target, &config, output)?;
            let result = commands::ping(&mut ctx).await;
            finish_run(ctx, result)
        }
        Commands::Users { command } => {
            let mut ctx = db_context(target, &config, output)?;
            let result = run_users(&mut ctx, command).await;
            finish_run(ctx, result)
        }
    }
}

async fn run_users(ctx: &mut DbContext<'_>, command: UsersCommands) -> Result<()> {
    match command {
        UsersCommands::Show { selector } => commands::show(ctx, &selector.selector()?).await,
        UsersCommands::Duplicates => commands::duplicates(ctx).await,
        UsersCommands::Dedupe {
            email,
            keep_id,
            open_id,
            dry_run,
            yes,
        } => {
            let req = DedupeRequest {
                email,
                keep: keep_id.map_or(KeepPolicy::LowestId, KeepPolicy::Id),
                open_id,
            };
            commands::dedupe(ctx, &req, dry_run, yes).await
        }
        UsersCommands::ReassignOpenid {
            id,
            open_id,
            dry_run,
            yes,
        } => commands::reassign_open_id(ctx, id, &open_id, dry_run, yes).await,
        UsersCommands::SetRole {
            selector,
            role,
            dry_run,
            yes,
        } => commands::set_role(ctx, &selector.selector()?, role, dry_run, yes).await,
    }
}

/// Resolve target, timeout and audit sink. Configuration problems surface
/// here, before any connection is attempted.
fn db_context<'a>(args: &TargetArgs, config: &'a Config, output: &'a Output) -> Result<DbContext<'a>> {
    let target = connection::resolve(
        config,
        args.database_url.as_deref(),
        args.connection.as_deref(),
        args.env_var.as_deref(),
    )?;

    let connect_timeout = match args.connect_timeout.as_deref() {
        Some(s) => connection::parse_duration(s).context("Invalid --connect-timeout")?,
        None => match config.connect_timeout() {
            Some(s) => connection::parse_duration(s)?,
            None => connection::DEFAULT_CONNECT_TIMEOUT,
        },
    };

    let audit_path = args
        .audit_log
        .as_deref()
        .or_else(|| config.audit_path().map(Path::new));
    let audit = match audit_path {
        Some(path) => {
            let audit = AuditLog::open(path, &target.display())?;
            output.verbose(&format!(
                "Audit log: {} (run {})",
                path.display(),
                audit.run_id()
            ));
            audit
        }
        None => AuditLog::disabled(),
    };

    Ok(DbContext {
        config,
        output,
        target,
        connect_timeout,
        audit,
    })
}

/// Close the audit trail for this run. The command's own error wins.
fn finish_run(mut ctx: DbContext<'_>, result: Result<()>) -> Result<()> {
    let end = match &result {
        Ok(()) => json!({ "ok": true }),
        Err(e) => json!({ "ok": false, "error": format!("{e:#}") }),
    };
    let recorded = ctx.audit.record("run_end", end);
    result.and(recorded)
}
