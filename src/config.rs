use anyhow::{bail, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::connection::ConnectionConfig;
use crate::sql::validate_ident;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "sqlmend.toml";

/// Main configuration structure loaded from sqlmend.toml
#[derive(Deserialize, Default, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub database: Option<DatabaseConfig>,
    pub paths: Option<PathsConfig>,
    pub users: Option<UsersConfig>,
    pub audit: Option<AuditConfig>,
    pub production: Option<ProductionConfig>,
    /// Named database connections
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

#[derive(Deserialize, Debug)]
pub struct DatabaseConfig {
    /// URL template; `${VAR}` references are expanded from the environment
    pub url: Option<String>,
    /// Connection timeout, e.g. "5s" or "500ms"
    pub connect_timeout: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct PathsConfig {
    pub migrations: Option<String>,
}

/// Location of the account table the repair commands operate on
#[derive(Deserialize, Debug)]
pub struct UsersConfig {
    pub table: Option<String>,
    pub open_id_column: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct AuditConfig {
    /// JSON-lines file that every run appends to
    pub path: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ProductionConfig {
    pub patterns: Option<Vec<String>>,
}

/// Resolved table and column names for the account table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsersTable {
    pub table: String,
    pub open_id_column: String,
}

impl Default for UsersTable {
    fn default() -> Self {
        Self {
            table: "users".to_string(),
            open_id_column: "openId".to_string(),
        }
    }
}

impl Config {
    /// Load config from file, or return default if no config exists.
    /// If an explicit path is provided via --config, it MUST exist (error if not).
    /// If no path is provided, check ./sqlmend.toml (use default if not found).
    pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
        let config_path = match path {
            Some(p) => {
                if !p.exists() {
                    bail!("Config file not found: {}", p.display());
                }
                p
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    default_path
                } else {
                    return Ok(Config::default());
                }
            }
        };

        let contents = fs::read_to_string(config_path)?;
        Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {:#}", config_path.display(), e))
    }

    /// Parse and validate config text.
    pub fn parse(contents: &str) -> Result<Self, anyhow::Error> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if let Some(ref paths) = self.paths {
            if let Some(ref p) = paths.migrations {
                Self::validate_path(p, "paths.migrations")?;
            }
        }
        if let Some(ref users) = self.users {
            if let Some(ref t) = users.table {
                validate_ident(t, "users.table")?;
            }
            if let Some(ref c) = users.open_id_column {
                validate_ident(c, "users.open_id_column")?;
            }
        }
        if let Some(ref db) = self.database {
            if let Some(ref url) = db.url {
                crate::connection::reject_literal_password(url, "database.url")?;
            }
            if let Some(ref t) = db.connect_timeout {
                crate::connection::parse_duration(t)
                    .map_err(|e| anyhow::anyhow!("Invalid database.connect_timeout: {}", e))?;
            }
        }
        for (name, conn) in &self.connections {
            if let Some(ref url) = conn.url {
                crate::connection::reject_literal_password(url, &format!("connections.{}.url", name))?;
            }
        }
        Ok(())
    }

    /// Validate a single path doesn't contain path traversal
    fn validate_path(path: &str, field: &str) -> Result<(), anyhow::Error> {
        if path.contains("..") {
            bail!(
                "Invalid {} path '{}': paths cannot contain '..'",
                field,
                path
            );
        }
        if Path::new(path).is_absolute() {
            bail!("Invalid {} path '{}': paths must be relative", field, path);
        }
        Ok(())
    }

    /// Get migrations directory path
    pub fn migrations_dir(&self) -> &str {
        self.paths
            .as_ref()
            .and_then(|p| p.migrations.as_deref())
            .unwrap_or("db/migrations")
    }

    /// Account table location, defaulting to `users`.`openId`
    pub fn users_table(&self) -> UsersTable {
        let defaults = UsersTable::default();
        let users = self.users.as_ref();
        UsersTable {
            table: users
                .and_then(|u| u.table.clone())
                .unwrap_or(defaults.table),
            open_id_column: users
                .and_then(|u| u.open_id_column.clone())
                .unwrap_or(defaults.open_id_column),
        }
    }

    /// Audit log path from config (CLI --audit-log takes precedence)
    pub fn audit_path(&self) -> Option<&str> {
        self.audit.as_ref().and_then(|a| a.path.as_deref())
    }

    /// Configured connect timeout string, if any
    pub fn connect_timeout(&self) -> Option<&str> {
        self.database
            .as_ref()
            .and_then(|d| d.connect_timeout.as_deref())
    }

    /// Get production URL patterns from config
    pub fn production_patterns(&self) -> Vec<String> {
        self.production
            .as_ref()
            .and_then(|p| p.patterns.clone())
            .unwrap_or_default()
    }
}

/// Check if a URL matches production patterns (for warning, not blocking)
pub fn url_matches_production_patterns(url: &str, config: &Config) -> bool {
    let lower = url.to_lowercase();

    let builtin = ["prod", "production", "primary"];
    if builtin.iter().any(|k| lower.contains(k)) {
        return true;
    }

    let cloud = [
        ".rds.amazonaws.com",
        ".mysql.database.azure.com",
        ".cloudsql.google.com",
        ".psdb.cloud",
        ".tidbcloud.com",
    ];
    if cloud.iter().any(|p| lower.contains(p)) {
        return true;
    }

    for pattern in config.production_patterns() {
        if lower.contains(&pattern.to_lowercase()) {
            return true;
        }
    }

    false
}
