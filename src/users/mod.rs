//! Account repair operations on the users table.
//!
//! Every mutating operation is split into a read-only `plan_*` step, which
//! validates the request and captures the rows it will touch, and an
//! `apply_*` step, which performs the DML inside one transaction and verifies
//! post-conditions before committing. A failed post-condition rolls back.

mod mysql;

pub use mysql::MySqlUserStore;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::report::{or_null, render_table, verify, Check};
use crate::session::{DbError, Session};

/// A row of the users table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: i64,
    pub email: Option<String>,
    pub name: Option<String>,
    pub open_id: Option<String>,
    /// Raw column value; may hold roles this tool does not know about.
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Superadmin,
    TenantAdmin,
    Staff,
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Superadmin => "superadmin",
            Role::TenantAdmin => "tenant_admin",
            Role::Staff => "staff",
            Role::Client => "client",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "superadmin" => Ok(Role::Superadmin),
            "tenant_admin" => Ok(Role::TenantAdmin),
            "staff" => Ok(Role::Staff),
            "client" => Ok(Role::Client),
            other => Err(format!(
                "unknown role '{}' (expected superadmin, tenant_admin, staff or client)",
                other
            )),
        }
    }
}

/// Fields to overwrite on one row. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.open_id.is_none() && self.role.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateField {
    Email,
    OpenId,
}

/// A value held by more than one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub field: DuplicateField,
    pub value: String,
    pub ids: Vec<i64>,
}

/// How rows are picked for `show` and `set-role`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSelector {
    Id(i64),
    Email(String),
    OpenId(String),
}

impl fmt::Display for UserSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserSelector::Id(id) => write!(f, "id {}", id),
            UserSelector::Email(email) => write!(f, "email {}", email),
            UserSelector::OpenId(open_id) => write!(f, "OpenID {}", open_id),
        }
    }
}

/// Storage operations the repairs need, on top of raw statement execution.
#[async_trait]
pub trait UserStore: Session {
    async fn find_by_id(&mut self, id: i64) -> Result<Option<UserRecord>, DbError>;
    async fn find_by_email(&mut self, email: &str) -> Result<Vec<UserRecord>, DbError>;
    async fn find_by_open_id(&mut self, open_id: &str) -> Result<Vec<UserRecord>, DbError>;
    /// Emails and OpenIDs held by more than one row, ids ascending.
    async fn duplicate_groups(&mut self) -> Result<Vec<DuplicateGroup>, DbError>;
    async fn delete_ids(&mut self, ids: &[i64]) -> Result<u64, DbError>;
    async fn update_user(&mut self, id: i64, patch: &UserPatch) -> Result<u64, DbError>;
}

/// Rows matching `selector`, ids ascending.
pub async fn find_users<S: UserStore>(store: &mut S, selector: &UserSelector) -> Result<Vec<UserRecord>> {
    let mut users: Vec<UserRecord> = match selector {
        UserSelector::Id(id) => store.find_by_id(*id).await?.into_iter().collect(),
        UserSelector::Email(email) => store.find_by_email(email).await?,
        UserSelector::OpenId(open_id) => store.find_by_open_id(open_id).await?,
    };
    users.sort_by_key(|u| u.id);
    Ok(users)
}

pub async fn duplicates<S: UserStore>(store: &mut S) -> Result<Vec<DuplicateGroup>> {
    Ok(store.duplicate_groups().await?)
}

/// Operator-facing table of user rows.
pub fn render_users(users: &[UserRecord]) -> String {
    let rows: Vec<Vec<Option<String>>> = users
        .iter()
        .map(|u| {
            vec![
                Some(u.id.to_string()),
                u.email.clone(),
                u.name.clone(),
                u.open_id.clone(),
                Some(u.role.clone()),
            ]
        })
        .collect();
    render_table(&["id", "email", "name", "openId", "role"], &rows)
}

/// Result of a committed repair.
#[derive(Debug, Clone, Serialize)]
pub struct Applied {
    pub after: Vec<UserRecord>,
    pub checks: Vec<Check>,
}

/// Which row survives a duplicate cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepPolicy {
    /// The oldest row sharing the email.
    LowestId,
    /// An explicit row, which may currently carry a different email.
    Id(i64),
}

#[derive(Debug, Clone)]
pub struct DedupeRequest {
    pub email: String,
    pub keep: KeepPolicy,
    /// OpenID the surviving row must end up with.
    pub open_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupePlan {
    pub email: String,
    pub keep: UserRecord,
    pub delete: Vec<UserRecord>,
    pub update: UserPatch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_id: Option<String>,
}

impl DedupePlan {
    pub fn is_noop(&self) -> bool {
        self.delete.is_empty() && self.update.is_empty()
    }

    pub fn before(&self) -> Vec<UserRecord> {
        let mut rows = vec![self.keep.clone()];
        rows.extend(self.delete.iter().cloned());
        rows.sort_by_key(|u| u.id);
        rows
    }
}

/// Work out which rows a duplicate cleanup deletes and how the survivor changes.
pub async fn plan_dedupe<S: UserStore>(store: &mut S, req: &DedupeRequest) -> Result<DedupePlan> {
    if req.email.trim().is_empty() {
        bail!("Email must not be empty");
    }
    let mut sharing = store.find_by_email(&req.email).await?;
    sharing.sort_by_key(|u| u.id);

    let keep = match req.keep {
        KeepPolicy::LowestId => sharing
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("No users found with email {}", req.email))?,
        KeepPolicy::Id(id) => store
            .find_by_id(id)
            .await?
            .ok_or_else(|| anyhow!("User {} not found", id))?,
    };

    let delete: Vec<UserRecord> = sharing.into_iter().filter(|u| u.id != keep.id).collect();

    if let Some(ref token) = req.open_id {
        if token.trim().is_empty() {
            bail!("OpenID must not be empty");
        }
        let conflicts: Vec<i64> = store
            .find_by_open_id(token)
            .await?
            .into_iter()
            .filter(|u| u.id != keep.id && !delete.iter().any(|d| d.id == u.id))
            .map(|u| u.id)
            .collect();
        if !conflicts.is_empty() {
            bail!(
                "OpenID {} is held by user(s) {:?} outside this email group; reassign or clean them up first",
                token,
                conflicts
            );
        }
    }

    let update = UserPatch {
        email: (keep.email.as_deref() != Some(req.email.as_str())).then(|| req.email.clone()),
        open_id: req
            .open_id
            .clone()
            .filter(|token| keep.open_id.as_deref() != Some(token.as_str())),
        role: None,
    };

    Ok(DedupePlan {
        email: req.email.clone(),
        keep,
        delete,
        update,
        open_id: req.open_id.clone(),
    })
}

/// Delete the duplicates and update the survivor in one transaction.
pub async fn apply_dedupe<S: UserStore>(store: &mut S, plan: &DedupePlan) -> Result<Applied> {
    store.execute("START TRANSACTION").await?;
    let outcome = dedupe_steps(store, plan).await;
    finish(store, outcome).await
}

async fn dedupe_steps<S: UserStore>(store: &mut S, plan: &DedupePlan) -> Result<Applied> {
    let ids: Vec<i64> = plan.delete.iter().map(|u| u.id).collect();
    if !ids.is_empty() {
        store.delete_ids(&ids).await?;
    }
    if !plan.update.is_empty() {
        store.update_user(plan.keep.id, &plan.update).await?;
    }

    let with_email = store.find_by_email(&plan.email).await?;
    let survivor = store.find_by_id(plan.keep.id).await?;
    let mut after = with_email.clone();
    if let Some(ref s) = survivor {
        if !after.iter().any(|u| u.id == s.id) {
            after.push(s.clone());
        }
    }
    after.sort_by_key(|u| u.id);

    let mut checks = vec![
        Check::expect_eq("rows with email", 1, with_email.len()),
        Check::expect_eq(
            "canonical row holds email",
            plan.keep.id.to_string(),
            with_email
                .first()
                .map(|u| u.id.to_string())
                .unwrap_or_else(|| "none".to_string()),
        ),
        Check::expect_eq(
            "role unchanged",
            plan.keep.role.clone(),
            survivor.as_ref().map(|u| u.role.clone()).unwrap_or_default(),
        ),
    ];
    if let Some(ref token) = plan.open_id {
        checks.push(Check::expect_eq(
            "canonical OpenID",
            token.clone(),
            or_null(survivor.as_ref().and_then(|u| u.open_id.as_deref())),
        ));
        let holders = store.find_by_open_id(token).await?;
        checks.push(Check::expect_eq("rows holding OpenID", 1, holders.len()));
    }

    let checks = verify(checks)?;
    Ok(Applied { after, checks })
}

#[derive(Debug, Clone, Serialize)]
pub struct ReassignPlan {
    pub user: UserRecord,
    pub open_id: String,
}

impl ReassignPlan {
    pub fn is_noop(&self) -> bool {
        self.user.open_id.as_deref() == Some(self.open_id.as_str())
    }
}

/// Validate moving an OpenID onto `id`. Refuses if any other row holds it.
pub async fn plan_reassign_open_id<S: UserStore>(store: &mut S, id: i64, open_id: &str) -> Result<ReassignPlan> {
    if open_id.trim().is_empty() {
        bail!("OpenID must not be empty");
    }
    let user = store
        .find_by_id(id)
        .await?
        .ok_or_else(|| anyhow!("User {} not found", id))?;

    let others: Vec<i64> = store
        .find_by_open_id(open_id)
        .await?
        .into_iter()
        .filter(|u| u.id != id)
        .map(|u| u.id)
        .collect();
    if !others.is_empty() {
        bail!(
            "OpenID {} is already held by user(s) {:?}; run `sqlmend users dedupe` first",
            open_id,
            others
        );
    }

    Ok(ReassignPlan {
        user,
        open_id: open_id.to_string(),
    })
}

pub async fn apply_reassign_open_id<S: UserStore>(store: &mut S, plan: &ReassignPlan) -> Result<Applied> {
    store.execute("START TRANSACTION").await?;
    let outcome = reassign_steps(store, plan).await;
    finish(store, outcome).await
}

async fn reassign_steps<S: UserStore>(store: &mut S, plan: &ReassignPlan) -> Result<Applied> {
    let patch = UserPatch {
        open_id: Some(plan.open_id.clone()),
        ..UserPatch::default()
    };
    store.update_user(plan.user.id, &patch).await?;

    let holders = store.find_by_open_id(&plan.open_id).await?;
    let after = store.find_by_id(plan.user.id).await?;
    let checks = verify(vec![
        Check::expect_eq("rows holding OpenID", 1, holders.len()),
        Check::expect_eq(
            "OpenID on user",
            plan.open_id.clone(),
            or_null(after.as_ref().and_then(|u| u.open_id.as_deref())),
        ),
        Check::expect_eq(
            "role unchanged",
            plan.user.role.clone(),
            after.as_ref().map(|u| u.role.clone()).unwrap_or_default(),
        ),
    ])?;

    Ok(Applied {
        after: after.into_iter().collect(),
        checks,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct SetRolePlan {
    pub user: UserRecord,
    pub role: Role,
}

impl SetRolePlan {
    pub fn is_noop(&self) -> bool {
        self.user.role == self.role.as_str()
    }
}

/// Resolve the single row whose role changes.
pub async fn plan_set_role<S: UserStore>(store: &mut S, selector: &UserSelector, role: Role) -> Result<SetRolePlan> {
    let mut users = find_users(store, selector).await?;
    match users.len() {
        0 => bail!("No user found with {}", selector),
        1 => Ok(SetRolePlan {
            user: users.remove(0),
            role,
        }),
        n => {
            let ids: Vec<i64> = users.iter().map(|u| u.id).collect();
            bail!(
                "{} users match {} (ids {:?}); select one with --id or run `sqlmend users dedupe` first",
                n,
                selector,
                ids
            )
        }
    }
}

pub async fn apply_set_role<S: UserStore>(store: &mut S, plan: &SetRolePlan) -> Result<Applied> {
    store.execute("START TRANSACTION").await?;
    let outcome = set_role_steps(store, plan).await;
    finish(store, outcome).await
}

async fn set_role_steps<S: UserStore>(store: &mut S, plan: &SetRolePlan) -> Result<Applied> {
    let patch = UserPatch {
        role: Some(plan.role),
        ..UserPatch::default()
    };
    store.update_user(plan.user.id, &patch).await?;

    let after = store.find_by_id(plan.user.id).await?;
    let checks = verify(vec![
        Check::expect_eq(
            "role",
            plan.role.as_str().to_string(),
            after.as_ref().map(|u| u.role.clone()).unwrap_or_default(),
        ),
        Check::expect_eq(
            "email unchanged",
            or_null(plan.user.email.as_deref()),
            or_null(after.as_ref().and_then(|u| u.email.as_deref())),
        ),
        Check::expect_eq(
            "OpenID unchanged",
            or_null(plan.user.open_id.as_deref()),
            or_null(after.as_ref().and_then(|u| u.open_id.as_deref())),
        ),
    ])?;

    Ok(Applied {
        after: after.into_iter().collect(),
        checks,
    })
}

/// Commit on success, roll back on any failure.
async fn finish<S: Session, T>(store: &mut S, outcome: Result<T>) -> Result<T> {
    match outcome {
        Ok(value) => {
            store.execute("COMMIT").await?;
            Ok(value)
        }
        Err(err) => match store.execute("ROLLBACK").await {
            Ok(_) => Err(err),
            Err(rollback) => Err(err.context(format!(
                "ROLLBACK failed ({}); transaction state is uncertain, inspect the affected rows",
                rollback
            ))),
        },
    }
}
