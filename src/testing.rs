//! In-memory sessions for unit tests.
//!
//! `MockSchema` understands just enough DDL (CREATE TABLE, ALTER TABLE ADD
//! COLUMN/INDEX, CREATE INDEX) to reproduce MySQL's error numbers for the
//! executor. `MockUserStore` holds user rows with snapshot-based transactions.

use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::session::{DbError, Session};
use crate::users::{DuplicateField, DuplicateGroup, UserPatch, UserRecord, UserStore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockTable {
    pub columns: Vec<String>,
    pub indexes: BTreeSet<String>,
}

#[derive(Default)]
struct SchemaState {
    tables: BTreeMap<String, MockTable>,
    executed: Vec<String>,
    fail_close: bool,
}

/// Shared handle to an in-memory schema; sessions and the test see the same state.
#[derive(Clone, Default)]
pub struct MockSchema {
    state: Arc<Mutex<SchemaState>>,
    closes: Arc<AtomicUsize>,
}

impl MockSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> MockSession {
        MockSession {
            state: self.state.clone(),
            closes: self.closes.clone(),
        }
    }

    pub fn create_table(&self, name: &str, columns: &[&str]) {
        self.state.lock().unwrap().tables.insert(
            name.to_lowercase(),
            MockTable {
                columns: columns.iter().map(|c| c.to_lowercase()).collect(),
                indexes: BTreeSet::new(),
            },
        );
    }

    pub fn add_column(&self, table: &str, column: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .tables
            .get_mut(&table.to_lowercase())
            .expect("table exists")
            .columns
            .push(column.to_lowercase());
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(&table.to_lowercase())
            .is_some_and(|t| t.columns.contains(&column.to_lowercase()))
    }

    pub fn snapshot(&self) -> BTreeMap<String, MockTable> {
        self.state.lock().unwrap().tables.clone()
    }

    /// Every statement sent, including failed ones.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().unwrap().executed.clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_close(&self) {
        self.state.lock().unwrap().fail_close = true;
    }
}

pub struct MockSession {
    state: Arc<Mutex<SchemaState>>,
    closes: Arc<AtomicUsize>,
}

fn pattern(cell: &'static OnceLock<Regex>, re: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(re).unwrap())
}

fn create_table_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?is)^CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?`?(\w+)`?\s*\((.*)\)",
    )
}

fn add_index_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?is)^ALTER\s+TABLE\s+`?(\w+)`?\s+ADD\s+(?:UNIQUE\s+)?(?:INDEX|KEY)\s+`?(\w+)`?\s*\(([^)]*)\)",
    )
}

fn add_column_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?is)^ALTER\s+TABLE\s+`?(\w+)`?\s+ADD\s+(?:COLUMN\s+)?`?(\w+)`?",
    )
}

fn create_index_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    pattern(
        &RE,
        r"(?is)^CREATE\s+(?:UNIQUE\s+)?INDEX\s+`?(\w+)`?\s+ON\s+`?(\w+)`?\s*\(([^)]*)\)",
    )
}

fn unquote(s: &str) -> String {
    s.trim().trim_matches('`').to_lowercase()
}

/// Split a column list on commas outside parentheses.
fn split_top_level(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in body.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    parts.push(current);
    parts
}

fn missing_table(table: &str) -> DbError {
    DbError::server(1146, "42S02", format!("Table '{}' doesn't exist", table))
}

fn add_index(state: &mut SchemaState, table: &str, index: &str, cols: &str) -> Result<u64, DbError> {
    let t = state
        .tables
        .get_mut(table)
        .ok_or_else(|| missing_table(table))?;
    for col in cols.split(',').map(unquote) {
        if !t.columns.contains(&col) {
            return Err(DbError::server(
                1072,
                "42000",
                format!("Key column '{}' doesn't exist in table", col),
            ));
        }
    }
    if !t.indexes.insert(index.to_string()) {
        return Err(DbError::server(
            1061,
            "42000",
            format!("Duplicate key name '{}'", index),
        ));
    }
    Ok(0)
}

fn apply_ddl(state: &mut SchemaState, sql: &str) -> Result<u64, DbError> {
    let upper = sql.trim().to_uppercase();
    if upper.starts_with("SELECT")
        || upper == "START TRANSACTION"
        || upper == "COMMIT"
        || upper == "ROLLBACK"
    {
        return Ok(0);
    }

    if let Some(caps) = create_table_re().captures(sql) {
        let table = caps[1].to_lowercase();
        if state.tables.contains_key(&table) {
            return Err(DbError::server(
                1050,
                "42S01",
                format!("Table '{}' already exists", table),
            ));
        }
        let columns = split_top_level(&caps[2])
            .iter()
            .filter_map(|def| def.split_whitespace().next().map(unquote))
            .filter(|name| {
                !matches!(
                    name.as_str(),
                    "primary" | "key" | "index" | "unique" | "constraint" | "foreign"
                )
            })
            .collect();
        state.tables.insert(
            table,
            MockTable {
                columns,
                indexes: BTreeSet::new(),
            },
        );
        return Ok(0);
    }

    if let Some(caps) = add_index_re().captures(sql) {
        return add_index(state, &caps[1].to_lowercase(), &caps[2].to_lowercase(), &caps[3]);
    }

    if let Some(caps) = add_column_re().captures(sql) {
        let table = caps[1].to_lowercase();
        let column = caps[2].to_lowercase();
        let t = state
            .tables
            .get_mut(&table)
            .ok_or_else(|| missing_table(&table))?;
        if t.columns.contains(&column) {
            return Err(DbError::server(
                1060,
                "42S21",
                format!("Duplicate column name '{}'", column),
            ));
        }
        t.columns.push(column);
        return Ok(0);
    }

    if let Some(caps) = create_index_re().captures(sql) {
        return add_index(state, &caps[2].to_lowercase(), &caps[1].to_lowercase(), &caps[3]);
    }

    Err(DbError::server(
        1064,
        "42000",
        "You have an error in your SQL syntax",
    ))
}

#[async_trait]
impl Session for MockSession {
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        let mut state = self.state.lock().unwrap();
        state.executed.push(sql.to_string());
        apply_ddl(&mut state, sql)
    }

    async fn close(self) -> Result<(), DbError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.state.lock().unwrap().fail_close {
            return Err(DbError::client("connection reset while closing"));
        }
        Ok(())
    }
}

pub fn user(id: i64, email: Option<&str>, open_id: Option<&str>, role: &str) -> UserRecord {
    UserRecord {
        id,
        email: email.map(str::to_string),
        name: None,
        open_id: open_id.map(str::to_string),
        role: role.to_string(),
    }
}

#[derive(Clone, Default)]
pub struct CloseCounter(Arc<AtomicUsize>);

impl CloseCounter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Users table held in memory, with START TRANSACTION / COMMIT / ROLLBACK.
#[derive(Default)]
pub struct MockUserStore {
    rows: BTreeMap<i64, UserRecord>,
    snapshot: Option<BTreeMap<i64, UserRecord>>,
    clobber_role: Option<String>,
    rollback_fails: bool,
    closes: CloseCounter,
}

impl MockUserStore {
    pub fn with_users(users: Vec<UserRecord>) -> Self {
        Self {
            rows: users.into_iter().map(|u| (u.id, u)).collect(),
            ..Self::default()
        }
    }

    /// Rows in id order.
    pub fn rows(&self) -> Vec<UserRecord> {
        self.rows.values().cloned().collect()
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Make every update also overwrite the role, to simulate a bad write.
    pub fn clobber_role_on_update(&mut self, role: &str) {
        self.clobber_role = Some(role.to_string());
    }

    /// Make ROLLBACK fail as if the connection dropped mid-transaction.
    pub fn fail_rollback(&mut self) {
        self.rollback_fails = true;
    }

    pub fn close_counter(&self) -> CloseCounter {
        self.closes.clone()
    }

    fn matching(&self, pred: impl Fn(&UserRecord) -> bool) -> Vec<UserRecord> {
        self.rows.values().filter(|u| pred(u)).cloned().collect()
    }
}

#[async_trait]
impl Session for MockUserStore {
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        match sql.trim().to_uppercase().as_str() {
            "START TRANSACTION" => {
                self.snapshot = Some(self.rows.clone());
                Ok(0)
            }
            "COMMIT" => {
                self.snapshot = None;
                Ok(0)
            }
            "ROLLBACK" => {
                if self.rollback_fails {
                    return Err(DbError::client("Lost connection to MySQL server during query"));
                }
                if let Some(rows) = self.snapshot.take() {
                    self.rows = rows;
                }
                Ok(0)
            }
            _ => Err(DbError::server(
                1064,
                "42000",
                "You have an error in your SQL syntax",
            )),
        }
    }

    async fn close(self) -> Result<(), DbError> {
        self.closes.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl UserStore for MockUserStore {
    async fn find_by_id(&mut self, id: i64) -> Result<Option<UserRecord>, DbError> {
        Ok(self.rows.get(&id).cloned())
    }

    async fn find_by_email(&mut self, email: &str) -> Result<Vec<UserRecord>, DbError> {
        Ok(self.matching(|u| u.email.as_deref() == Some(email)))
    }

    async fn find_by_open_id(&mut self, open_id: &str) -> Result<Vec<UserRecord>, DbError> {
        Ok(self.matching(|u| u.open_id.as_deref() == Some(open_id)))
    }

    async fn duplicate_groups(&mut self) -> Result<Vec<DuplicateGroup>, DbError> {
        let mut groups = Vec::new();
        for field in [DuplicateField::Email, DuplicateField::OpenId] {
            let mut by_value: BTreeMap<String, Vec<i64>> = BTreeMap::new();
            for u in self.rows.values() {
                let value = match field {
                    DuplicateField::Email => u.email.as_deref(),
                    DuplicateField::OpenId => u.open_id.as_deref(),
                };
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    by_value.entry(v.to_string()).or_default().push(u.id);
                }
            }
            groups.extend(
                by_value
                    .into_iter()
                    .filter(|(_, ids)| ids.len() > 1)
                    .map(|(value, ids)| DuplicateGroup { field, value, ids }),
            );
        }
        Ok(groups)
    }

    async fn delete_ids(&mut self, ids: &[i64]) -> Result<u64, DbError> {
        let mut deleted = 0;
        for id in ids {
            if self.rows.remove(id).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn update_user(&mut self, id: i64, patch: &UserPatch) -> Result<u64, DbError> {
        let clobber = self.clobber_role.clone();
        let Some(row) = self.rows.get_mut(&id) else {
            return Ok(0);
        };
        if let Some(ref email) = patch.email {
            row.email = Some(email.clone());
        }
        if let Some(ref open_id) = patch.open_id {
            row.open_id = Some(open_id.clone());
        }
        if let Some(role) = patch.role {
            row.role = role.as_str().to_string();
        }
        if let Some(role) = clobber {
            row.role = role;
        }
        Ok(1)
    }
}
