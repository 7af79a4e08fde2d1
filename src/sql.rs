//! SQL utilities for MySQL identifier handling.

use anyhow::{bail, Result};
use regex::Regex;
use std::sync::OnceLock;

/// Quote a MySQL identifier unconditionally.
///
/// Wraps the identifier in backticks and doubles any embedded backtick, so
/// reserved words and mixed-case names (`openId`) are passed through verbatim.
pub fn quote_ident(s: &str) -> String {
    format!("`{}`", s.replace('`', "``"))
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]{0,63}$").expect("valid regex"))
}

/// Validate an identifier taken from configuration.
///
/// Configured table and column names are interpolated into SQL text, so only
/// plain identifiers are accepted even though they are also quoted.
pub fn validate_ident(s: &str, field: &str) -> Result<()> {
    if !identifier_pattern().is_match(s) {
        bail!(
            "Invalid {} '{}': expected letters, digits, '_' or '$' (max 64 chars), not starting with a digit",
            field,
            s
        );
    }
    Ok(())
}
