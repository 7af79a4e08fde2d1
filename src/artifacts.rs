use anyhow::{bail, Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A migration artifact: a static SQL file of `;`-terminated statements.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// File name, e.g. `20250611093000_add_contact_columns.sql`
    pub name: String,
    pub path: PathBuf,
    pub sql: String,
    /// Hex SHA-256 of the file contents, recorded in the audit log
    pub checksum: String,
}

/// Read one artifact from disk.
pub fn load_artifact(path: &Path) -> Result<Artifact> {
    let sql = fs::read_to_string(path)
        .with_context(|| format!("Failed to read migration artifact {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    Ok(Artifact {
        name,
        path: path.to_path_buf(),
        checksum: checksum(&sql),
        sql,
    })
}

fn checksum(sql: &str) -> String {
    hex::encode(Sha256::digest(sql.as_bytes()))
}

/// List the `*.sql` artifacts directly inside `dir`, in file name order.
///
/// A missing directory is an error: running "all migrations" against a
/// mistyped path must not silently succeed.
pub fn discover(dir: &Path) -> Result<Vec<Artifact>> {
    if !dir.is_dir() {
        bail!(
            "Migrations directory not found: {}. Set [paths] migrations in sqlmend.toml or pass files explicitly.",
            dir.display()
        );
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    paths.sort();

    paths.iter().map(|p| load_artifact(p)).collect()
}

/// Create `YYYYMMDDHHMMSS_<name>.sql` in `dir` and return its path.
pub fn new_artifact(dir: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        bail!(
            "Invalid migration name '{}'. Use lowercase letters, digits and underscores.",
            name
        );
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let path = dir.join(format!("{}_{}.sql", timestamp, name));
    if path.exists() {
        bail!("Migration already exists: {}", path.display());
    }

    let contents = format!(
        "-- Migration: {}\n-- Created at: {}\n--\n-- Statements run in order and are re-run safely:\n-- existing tables, columns and indexes are skipped.\n\n",
        name, timestamp
    );
    fs::write(&path, contents)?;
    Ok(path)
}
