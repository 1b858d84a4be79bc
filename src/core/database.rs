/// Database adapter
///
/// Dumps, restores and locks the PostgreSQL database of the stack by running the
/// client tools inside its compose service.

use async_trait::async_trait;
use std::sync::Arc;

use super::docker::DockerManager;
use super::error::{OpsError, Result};
use crate::utils::{quote_ident, quote_literal, MIGRATION_LOCK_TABLE};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Plain SQL dump of the whole database
    async fn dump(&self) -> Result<Vec<u8>>;

    /// Drop and recreate the database, then load `dump`
    async fn restore(&self, dump: &[u8]) -> Result<()>;

    /// Take the migration lock for `owner`; fails with `MigrationInFlight` when
    /// someone else holds it
    async fn acquire_lock(&self, owner: &str) -> Result<()>;

    async fn release_lock(&self, owner: &str) -> Result<()>;

    async fn reachable(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct PostgresSettings {
    pub service: String,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
}

pub struct PostgresAdapter {
    docker: Arc<DockerManager>,
    settings: PostgresSettings,
}

impl PostgresAdapter {
    pub fn new(docker: Arc<DockerManager>, settings: PostgresSettings) -> Self {
        Self { docker, settings }
    }

    async fn exec(&self, command: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let env: Vec<(&str, &str)> = self
            .settings
            .password
            .as_deref()
            .map(|p| vec![("PGPASSWORD", p)])
            .unwrap_or_default();
        self.docker
            .exec(&self.settings.service, command, &env, stdin)
            .await
    }

    /// Run one statement and return its unaligned, tuples-only output
    async fn psql(&self, database: &str, sql: &str) -> Result<String> {
        let output = self
            .exec(
                &[
                    "psql",
                    "-v",
                    "ON_ERROR_STOP=1",
                    "-U",
                    &self.settings.user,
                    "-d",
                    database,
                    "-tA",
                    "-c",
                    sql,
                ],
                None,
            )
            .await?;
        Ok(String::from_utf8_lossy(&output).trim().to_string())
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    async fn dump(&self) -> Result<Vec<u8>> {
        let dump = self
            .exec(
                &[
                    "pg_dump",
                    "-U",
                    &self.settings.user,
                    "-d",
                    &self.settings.database,
                    "--no-owner",
                    "--no-privileges",
                ],
                None,
            )
            .await?;
        if dump.is_empty() {
            return Err(OpsError::Command {
                command: "pg_dump".to_string(),
                stderr: "empty dump".to_string(),
            });
        }
        tracing::debug!(database = %self.settings.database, bytes = dump.len(), "database dumped");
        Ok(dump)
    }

    async fn restore(&self, dump: &[u8]) -> Result<()> {
        let db = &self.settings.database;
        for sql in recreate_statements(db, &self.settings.user) {
            self.psql("postgres", &sql).await?;
        }
        tracing::info!(database = %db, "database recreated, loading dump");

        self.exec(
            &[
                "psql",
                "-v",
                "ON_ERROR_STOP=1",
                "-q",
                "-U",
                &self.settings.user,
                "-d",
                db,
            ],
            Some(dump),
        )
        .await?;
        Ok(())
    }

    async fn acquire_lock(&self, owner: &str) -> Result<()> {
        let db = &self.settings.database;
        self.psql(db, &lock_table_ddl()).await?;

        let inserted = self.psql(db, &lock_insert_sql(owner)).await?;
        if inserted == owner {
            tracing::debug!(owner, "migration lock acquired");
            return Ok(());
        }

        let holder = self
            .psql(
                db,
                &format!("SELECT holder FROM {} WHERE id = 1", MIGRATION_LOCK_TABLE),
            )
            .await?;
        Err(OpsError::MigrationInFlight {
            holder: if holder.is_empty() {
                "unknown".to_string()
            } else {
                holder
            },
        })
    }

    async fn release_lock(&self, owner: &str) -> Result<()> {
        let released = self
            .psql(&self.settings.database, &lock_release_sql(owner))
            .await?;
        if released.is_empty() {
            tracing::warn!(owner, "migration lock was not held at release");
        }
        Ok(())
    }

    async fn reachable(&self) -> bool {
        match self.psql(&self.settings.database, "SELECT 1").await {
            Ok(out) => out == "1",
            Err(e) => {
                tracing::debug!(error = %e, "database not reachable");
                false
            }
        }
    }
}

/// Statements run against the maintenance database before loading a dump
fn recreate_statements(database: &str, owner: &str) -> Vec<String> {
    vec![
        format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = {} AND pid <> pg_backend_pid()",
            quote_literal(database)
        ),
        format!("DROP DATABASE IF EXISTS {}", quote_ident(database)),
        format!(
            "CREATE DATABASE {} OWNER {}",
            quote_ident(database),
            quote_ident(owner)
        ),
    ]
}

fn lock_table_ddl() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (id integer PRIMARY KEY, holder text NOT NULL, acquired_at timestamptz NOT NULL DEFAULT now())",
        MIGRATION_LOCK_TABLE
    )
}

/// Returns the holder only when this insert won the row
fn lock_insert_sql(owner: &str) -> String {
    format!(
        "INSERT INTO {} (id, holder) VALUES (1, {}) ON CONFLICT (id) DO NOTHING RETURNING holder",
        MIGRATION_LOCK_TABLE,
        quote_literal(owner)
    )
}

fn lock_release_sql(owner: &str) -> String {
    format!(
        "DELETE FROM {} WHERE id = 1 AND holder = {} RETURNING holder",
        MIGRATION_LOCK_TABLE,
        quote_literal(owner)
    )
}
