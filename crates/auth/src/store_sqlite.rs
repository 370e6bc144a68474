//! SQLite-backed auth store using sqlx.

use std::path::Path;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    mememo_common::{Error, Result},
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions},
};

use crate::{
    store::AuthStore,
    types::{BearerTokenRecord, GrantAssignment, ThirdPartyAuthRequest, User},
};

fn db(e: sqlx::Error) -> Error {
    Error::external("database error", e)
}

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// SQLite persistence for users, permissions, grants, challenges and tokens.
pub struct SqliteAuthStore {
    pool: SqlitePool,
}

impl SqliteAuthStore {
    /// Open (creating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(db)?;
        Self::new(pool).await
    }

    /// Wrap an existing pool and create tables.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        for ddl in [
            "CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                email TEXT,
                is_superuser INTEGER NOT NULL DEFAULT 0,
                password_hash TEXT
            )",
            "CREATE TABLE IF NOT EXISTS user_permissions (
                username TEXT NOT NULL,
                permission TEXT NOT NULL,
                PRIMARY KEY (username, permission)
            )",
            "CREATE TABLE IF NOT EXISTS grants (
                code TEXT PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS grant_assignments (
                username TEXT NOT NULL,
                grant_code TEXT NOT NULL,
                expiry_ms INTEGER NOT NULL,
                PRIMARY KEY (username, grant_code)
            )",
            "CREATE TABLE IF NOT EXISTS auth3p_requests (
                identity TEXT PRIMARY KEY,
                alias TEXT NOT NULL,
                challenge TEXT NOT NULL,
                expiry_ms INTEGER NOT NULL,
                username TEXT
            )",
            "CREATE TABLE IF NOT EXISTS bearer_tokens (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                expiry_ms INTEGER NOT NULL
            )",
        ] {
            sqlx::query(ddl).execute(&self.pool).await.map_err(db)?;
        }
        Ok(())
    }
}

fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> User {
    User {
        username: row.get("username"),
        email: row.get("email"),
        is_superuser: row.get::<i64, _>("is_superuser") != 0,
        password_hash: row.get("password_hash"),
    }
}

fn challenge_from_row(row: &sqlx::sqlite::SqliteRow) -> ThirdPartyAuthRequest {
    ThirdPartyAuthRequest {
        identity: row.get("identity"),
        alias: row.get("alias"),
        challenge: row.get("challenge"),
        expiry: from_ms(row.get("expiry_ms")),
        user: row.get("username"),
    }
}

#[async_trait]
impl AuthStore for SqliteAuthStore {
    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.as_ref().map(user_from_row))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY username")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        Ok(rows.iter().map(user_from_row).collect())
    }

    async fn put_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (username, email, is_superuser, password_hash) VALUES (?, ?, ?, ?)
             ON CONFLICT(username) DO UPDATE SET
                email = excluded.email,
                is_superuser = excluded.is_superuser,
                password_hash = excluded.password_hash",
        )
        .bind(&user.username)
        .bind(&user.email)
        .bind(i64::from(user.is_superuser))
        .bind(&user.password_hash)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for stmt in [
            "DELETE FROM user_permissions WHERE username = ?",
            "DELETE FROM grant_assignments WHERE username = ?",
            "DELETE FROM bearer_tokens WHERE username = ?",
            "DELETE FROM auth3p_requests WHERE username = ?",
        ] {
            sqlx::query(stmt)
                .bind(username)
                .execute(&mut *tx)
                .await
                .map_err(db)?;
        }
        let result = sqlx::query("DELETE FROM users WHERE username = ?")
            .bind(username)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn permissions(&self, username: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT permission FROM user_permissions WHERE username = ? ORDER BY permission",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    async fn add_permission(&self, username: &str, permission: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO user_permissions (username, permission) VALUES (?, ?)")
            .bind(username)
            .bind(permission)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }

    async fn remove_permission(&self, username: &str, permission: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM user_permissions WHERE username = ? AND permission = ?")
                .bind(username)
                .bind(permission)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_grant(&self, code: &str) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO grants (code) VALUES (?)")
            .bind(code)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn grant_exists(&self, code: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT code FROM grants WHERE code = ?")
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.is_some())
    }

    async fn list_grants(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT code FROM grants ORDER BY code")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        Ok(rows.into_iter().map(|(c,)| c).collect())
    }

    async fn delete_grant(&self, code: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("DELETE FROM grant_assignments WHERE grant_code = ?")
            .bind(code)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        let result = sqlx::query("DELETE FROM grants WHERE code = ?")
            .bind(code)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn assignments(&self, username: &str) -> Result<Vec<GrantAssignment>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT grant_code, expiry_ms FROM grant_assignments
             WHERE username = ? ORDER BY grant_code",
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows
            .into_iter()
            .map(|(grant, expiry_ms)| GrantAssignment {
                username: username.to_string(),
                grant,
                expiry: from_ms(expiry_ms),
            })
            .collect())
    }

    async fn assign_grant(&self, assignment: &GrantAssignment) -> Result<()> {
        sqlx::query(
            "INSERT INTO grant_assignments (username, grant_code, expiry_ms) VALUES (?, ?, ?)
             ON CONFLICT(username, grant_code) DO UPDATE SET expiry_ms = excluded.expiry_ms",
        )
        .bind(&assignment.username)
        .bind(&assignment.grant)
        .bind(to_ms(assignment.expiry))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn unassign_grant(&self, username: &str, code: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM grant_assignments WHERE username = ? AND grant_code = ?")
                .bind(username)
                .bind(code)
                .execute(&self.pool)
                .await
                .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_challenge(&self, identity: &str) -> Result<Option<ThirdPartyAuthRequest>> {
        let row = sqlx::query("SELECT * FROM auth3p_requests WHERE identity = ?")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.as_ref().map(challenge_from_row))
    }

    async fn put_challenge(&self, request: &ThirdPartyAuthRequest) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO auth3p_requests (identity, alias, challenge, expiry_ms, username)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&request.identity)
        .bind(&request.alias)
        .bind(&request.challenge)
        .bind(to_ms(request.expiry))
        .bind(&request.user)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn delete_challenge(&self, identity: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM auth3p_requests WHERE identity = ?")
            .bind(identity)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_challenges(&self) -> Result<Vec<ThirdPartyAuthRequest>> {
        let rows = sqlx::query("SELECT * FROM auth3p_requests ORDER BY identity")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        Ok(rows.iter().map(challenge_from_row).collect())
    }

    async fn get_token(&self, id: &str) -> Result<Option<BearerTokenRecord>> {
        let row: Option<(String, String, i64)> =
            sqlx::query_as("SELECT id, username, expiry_ms FROM bearer_tokens WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db)?;
        Ok(row.map(|(id, username, expiry_ms)| BearerTokenRecord {
            id,
            username,
            expiry: from_ms(expiry_ms),
        }))
    }

    async fn put_token(&self, token: &BearerTokenRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        sqlx::query("DELETE FROM bearer_tokens WHERE username = ?")
            .bind(&token.username)
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        sqlx::query("INSERT INTO bearer_tokens (id, username, expiry_ms) VALUES (?, ?, ?)")
            .bind(&token.id)
            .bind(&token.username)
            .bind(to_ms(token.expiry))
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn delete_tokens(&self, username: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bearer_tokens WHERE username = ?")
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(result.rows_affected() > 0)
    }
}
