//! Database schema migrations for SQLite.
//!
//! Each migration is a SQL batch that transforms the schema from version N
//! to N+1.

use rusqlite::Connection;

use crate::error::{ChainStateError, Result};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// Idempotent: safe to call on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "chain-state schema migrated");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(ChainStateError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: block table.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per block on the current chain
        CREATE TABLE blocks (
            slot INTEGER PRIMARY KEY,         -- absolute slot, strictly increasing along the chain
            hash BLOB NOT NULL UNIQUE,        -- 32 bytes
            block_number INTEGER NOT NULL,    -- height
            header BLOB NOT NULL,             -- encoded HeaderContent
            body BLOB NOT NULL                -- opaque block body
        );
        "#,
    )?;
    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
