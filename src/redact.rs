//! Redaction utilities for safe output.
//!
//! ## Credential Lifecycle Rules
//!
//! 1. **Credentials arrive** via environment variable, `.env`, a connection
//!    command, or `--database-url`. Never from a literal in `sqlmend.toml`.
//! 2. **Credentials exist only in memory** during execution
//! 3. **Credentials never appear in stdout/stderr or the audit log**
//!
//! ## What Gets Redacted
//!
//! - **DSNs**: Password and query parameters removed (may contain TLS key paths or secrets)
//! - **SQL statements**: String literals replaced with `'...'` (emails, tokens)
//! - **Long statements**: Truncated to 200 characters

use url::Url;

/// Maximum statement length before truncation (characters).
const MAX_QUERY_LENGTH: usize = 200;

/// Redact a database URL (connection string).
///
/// Keeps: scheme, host, port, database name, user
/// Removes: password, query parameters that may contain secrets
pub fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.set_query(None);
            url.to_string()
        }
        Err(_) => {
            // Unparseable: strip everything up to the last '@' so a password
            // containing '@' cannot leak.
            if let Some(at_pos) = dsn.rfind('@') {
                if let Some(scheme_end) = dsn.find("://") {
                    let scheme = &dsn[..scheme_end + 3];
                    let after_at = &dsn[at_pos + 1..];
                    let host_part = after_at.split('?').next().unwrap_or(after_at);
                    format!("{}***@{}", scheme, host_part)
                } else {
                    "***REDACTED***".to_string()
                }
            } else if let Some(q_pos) = dsn.find('?') {
                dsn[..q_pos].to_string()
            } else {
                dsn.to_string()
            }
        }
    }
}

/// Redact SQL statement text.
///
/// - Removes string literals and replaces them with '...'
/// - Truncates long statements
/// - Keeps structure visible for debugging
pub fn redact_query(query: &str) -> String {
    let redacted = redact_string_literals(query);

    if redacted.chars().count() > MAX_QUERY_LENGTH {
        let cut: String = redacted.chars().take(MAX_QUERY_LENGTH).collect();
        format!("{}...", cut)
    } else {
        redacted
    }
}

/// Replace string literals with '...' placeholder.
///
/// Handles doubled quotes (`'O''Brien'`) and backslash escapes, which MySQL
/// accepts in both single- and double-quoted strings. Backtick identifiers are
/// left alone.
fn redact_string_literals(query: &str) -> String {
    let mut result = String::with_capacity(query.len());
    let mut in_string = false;
    let mut string_char = ' ';
    let mut chars = query.chars().peekable();

    while let Some(c) = chars.next() {
        if in_string {
            if c == '\\' {
                chars.next();
            } else if c == string_char {
                if chars.peek() == Some(&string_char) {
                    chars.next();
                } else {
                    result.push_str("'...'");
                    in_string = false;
                }
            }
        } else if c == '\'' || c == '"' {
            in_string = true;
            string_char = c;
        } else {
            result.push(c);
        }
    }

    if in_string {
        result.push_str("'...'");
    }

    result
}
