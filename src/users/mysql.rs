use async_trait::async_trait;
use sqlx::mysql::MySqlArguments;
use sqlx::query::QueryAs;
use sqlx::MySql;

use super::{DuplicateField, DuplicateGroup, UserPatch, UserRecord, UserStore};
use crate::config::UsersTable;
use crate::session::{DbError, MySqlSession, Session};
use crate::sql::quote_ident;

type UserRow = (i64, Option<String>, Option<String>, Option<String>, Option<String>);

/// [`UserStore`] over a live MySQL session. Values are always bound, never
/// interpolated; only the validated table and column names are spliced in.
pub struct MySqlUserStore {
    session: MySqlSession,
    table: String,
    open_id: String,
}

impl MySqlUserStore {
    pub fn new(session: MySqlSession, table: &UsersTable) -> Self {
        Self {
            session,
            table: quote_ident(&table.table),
            open_id: quote_ident(&table.open_id_column),
        }
    }

    fn select(&self, predicate: &str) -> String {
        // CASTs keep decoding independent of INT UNSIGNED ids and ENUM roles.
        format!(
            "SELECT CAST(`id` AS SIGNED), CAST(`email` AS CHAR), CAST(`name` AS CHAR), \
             CAST({open_id} AS CHAR), CAST(`role` AS CHAR) \
             FROM {table} WHERE {predicate} ORDER BY `id`",
            open_id = self.open_id,
            table = self.table,
            predicate = predicate
        )
    }

    async fn fetch_users<'q>(
        &mut self,
        query: QueryAs<'q, MySql, UserRow, MySqlArguments>,
    ) -> Result<Vec<UserRecord>, DbError> {
        let rows = query.fetch_all(self.session.conn()).await?;
        Ok(rows.into_iter().map(into_record).collect())
    }

    async fn groups(&mut self, column: &str, field: DuplicateField) -> Result<Vec<DuplicateGroup>, DbError> {
        let sql = format!(
            "SELECT CAST({col} AS CHAR), CAST(GROUP_CONCAT(`id` ORDER BY `id`) AS CHAR) \
             FROM {table} WHERE {col} IS NOT NULL AND {col} <> '' \
             GROUP BY {col} HAVING COUNT(*) > 1 ORDER BY {col}",
            col = column,
            table = self.table
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .fetch_all(self.session.conn())
            .await?;

        rows.into_iter()
            .map(|(value, ids)| -> Result<DuplicateGroup, DbError> {
                let ids = ids
                    .split(',')
                    .map(|id| {
                        id.trim().parse::<i64>().map_err(|_| {
                            DbError::client(format!("Unexpected id list from GROUP_CONCAT: {}", ids))
                        })
                    })
                    .collect::<Result<Vec<i64>, DbError>>()?;
                Ok(DuplicateGroup { field, value, ids })
            })
            .collect()
    }
}

fn into_record((id, email, name, open_id, role): UserRow) -> UserRecord {
    UserRecord {
        id,
        email,
        name,
        open_id,
        role: role.unwrap_or_default(),
    }
}

#[async_trait]
impl Session for MySqlUserStore {
    async fn execute(&mut self, sql: &str) -> Result<u64, DbError> {
        self.session.execute(sql).await
    }

    async fn close(self) -> Result<(), DbError> {
        self.session.close().await
    }
}

#[async_trait]
impl UserStore for MySqlUserStore {
    async fn find_by_id(&mut self, id: i64) -> Result<Option<UserRecord>, DbError> {
        let sql = self.select("`id` = ?");
        let users = self.fetch_users(sqlx::query_as(&sql).bind(id)).await?;
        Ok(users.into_iter().next())
    }

    async fn find_by_email(&mut self, email: &str) -> Result<Vec<UserRecord>, DbError> {
        let sql = self.select("`email` = ?");
        self.fetch_users(sqlx::query_as(&sql).bind(email)).await
    }

    async fn find_by_open_id(&mut self, open_id: &str) -> Result<Vec<UserRecord>, DbError> {
        let sql = self.select(&format!("{} = ?", self.open_id));
        self.fetch_users(sqlx::query_as(&sql).bind(open_id)).await
    }

    async fn duplicate_groups(&mut self) -> Result<Vec<DuplicateGroup>, DbError> {
        let mut groups = self.groups("`email`", DuplicateField::Email).await?;
        let open_id = self.open_id.clone();
        groups.extend(self.groups(&open_id, DuplicateField::OpenId).await?);
        Ok(groups)
    }

    async fn delete_ids(&mut self, ids: &[i64]) -> Result<u64, DbError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM {} WHERE `id` IN ({})",
            self.table, placeholders
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(*id);
        }
        Ok(query.execute(self.session.conn()).await?.rows_affected())
    }

    async fn update_user(&mut self, id: i64, patch: &UserPatch) -> Result<u64, DbError> {
        let mut assignments = Vec::new();
        if patch.email.is_some() {
            assignments.push("`email` = ?".to_string());
        }
        if patch.open_id.is_some() {
            assignments.push(format!("{} = ?", self.open_id));
        }
        if patch.role.is_some() {
            assignments.push("`role` = ?".to_string());
        }
        if assignments.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE `id` = ?",
            self.table,
            assignments.join(", ")
        );
        let mut query = sqlx::query(&sql);
        if let Some(ref email) = patch.email {
            query = query.bind(email.as_str());
        }
        if let Some(ref open_id) = patch.open_id {
            query = query.bind(open_id.as_str());
        }
        if let Some(role) = patch.role {
            query = query.bind(role.as_str());
        }
        query = query.bind(id);

        Ok(query.execute(self.session.conn()).await?.rows_affected())
    }
}
