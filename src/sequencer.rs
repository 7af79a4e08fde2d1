//! Statement sequencer: turns migration text into an ordered statement batch.
//!
//! Splitting happens on `;` outside of quoted strings, backtick identifiers and
//! comments. Entries that are empty or contain only comments are dropped, and
//! comment lines preceding a statement are not sent to the server. Source order
//! is preserved: later statements may depend on earlier ones.
//!
//! Malformed SQL is never rejected here; the server reports it at execution.

use serde::Serialize;
use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

/// Split raw migration text into executable statements, in source order.
pub fn split_statements(text: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut state = Scan::Code;
    // Byte offset of the first non-comment, non-whitespace char of the current entry.
    let mut code_start: Option<usize> = None;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match state {
            Scan::Code => match c {
                ';' => {
                    if let Some(start) = code_start.take() {
                        push_statement(&mut statements, &text[start..i]);
                    }
                }
                '\'' | '"' | '`' => {
                    code_start.get_or_insert(i);
                    state = Scan::Quoted(c);
                }
                '#' => state = Scan::LineComment,
                '-' if starts_line_comment(&text[i..], code_start.is_none()) => {
                    chars.next();
                    state = Scan::LineComment;
                }
                '/' if text[i..].starts_with("/*") => {
                    // `/*!...*/` and `/*+...*/` are executed by MySQL.
                    if is_executable_comment(&text[i..]) {
                        code_start.get_or_insert(i);
                    }
                    chars.next();
                    state = Scan::BlockComment;
                }
                c if c.is_whitespace() => {}
                _ => {
                    code_start.get_or_insert(i);
                }
            },
            Scan::Quoted(quote) => {
                if c == '\\' && quote != '`' {
                    chars.next();
                } else if c == quote {
                    state = Scan::Code;
                }
            }
            Scan::LineComment => {
                if c == '\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                if c == '*' && matches!(chars.peek(), Some((_, '/'))) {
                    chars.next();
                    state = Scan::Code;
                }
            }
        }
    }

    if let Some(start) = code_start {
        push_statement(&mut statements, &text[start..]);
    }

    statements
}

/// Inside a statement MySQL only treats `--` as a comment when followed by
/// whitespace or end of input. Before any code, every `--` opens a comment,
/// which covers markers such as `--> statement-breakpoint`.
fn starts_line_comment(rest: &str, at_entry_start: bool) -> bool {
    if !rest.starts_with("--") {
        return false;
    }
    at_entry_start
        || rest[2..]
            .chars()
            .next()
            .map_or(true, |c| c.is_whitespace())
}

fn is_executable_comment(rest: &str) -> bool {
    rest.starts_with("/*!") || rest.starts_with("/*+")
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}

/// Coarse statement classification used by `migrate plan` and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    CreateTable,
    AlterTable,
    CreateIndex,
    Drop,
    Insert,
    Update,
    Delete,
    Query,
    Other,
    /// The MySQL dialect parser could not read it; the server still decides.
    Unparsed,
}

impl StatementKind {
    pub fn label(&self) -> &'static str {
        match self {
            StatementKind::CreateTable => "create table",
            StatementKind::AlterTable => "alter table",
            StatementKind::CreateIndex => "create index",
            StatementKind::Drop => "drop",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
            StatementKind::Query => "query",
            StatementKind::Other => "other",
            StatementKind::Unparsed => "unparsed",
        }
    }

    /// Schema changes are the statements the already-applied guard can skip.
    pub fn is_schema_change(&self) -> bool {
        matches!(
            self,
            StatementKind::CreateTable
                | StatementKind::AlterTable
                | StatementKind::CreateIndex
                | StatementKind::Drop
        )
    }
}

/// Classify a single statement with the MySQL dialect parser.
pub fn describe(statement: &str) -> StatementKind {
    let dialect = MySqlDialect {};
    let parsed = match Parser::parse_sql(&dialect, statement) {
        Ok(parsed) => parsed,
        Err(_) => return StatementKind::Unparsed,
    };

    match parsed.first() {
        Some(Statement::CreateTable { .. }) => StatementKind::CreateTable,
        Some(Statement::AlterTable { .. }) => StatementKind::AlterTable,
        Some(Statement::CreateIndex { .. }) => StatementKind::CreateIndex,
        Some(Statement::Drop { .. }) => StatementKind::Drop,
        Some(Statement::Insert { .. }) => StatementKind::Insert,
        Some(Statement::Update { .. }) => StatementKind::Update,
        Some(Statement::Delete { .. }) => StatementKind::Delete,
        Some(Statement::Query { .. }) => StatementKind::Query,
        Some(_) => StatementKind::Other,
        None => StatementKind::Unparsed,
    }
}
