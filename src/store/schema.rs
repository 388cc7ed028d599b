//! DuckDB schema definitions and migration support.
//!
//! All items are gated behind `#[cfg(feature = "duckdb-store")]`.

use std::fmt;

// ---------------------------------------------------------------------------
// DDL constants
// ---------------------------------------------------------------------------

pub const DDL_SCHEMA_VERSION: &str = "\
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at BIGINT NOT NULL
);";

pub const DDL_MESSAGES: &str = "\
CREATE TABLE IF NOT EXISTS messages (
    conversation_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (conversation_id, seq)
);";

pub const DDL_ACCOUNTS: &str = "\
CREATE TABLE IF NOT EXISTS accounts (
    user_id TEXT PRIMARY KEY,
    balance DOUBLE NOT NULL DEFAULT 0,
    points DOUBLE NOT NULL DEFAULT 0,
    tier TEXT NOT NULL DEFAULT 'free',
    tier_expires_at BIGINT
);";

pub const DDL_USAGE_RECORDS: &str = "\
CREATE TABLE IF NOT EXISTS usage_records (
    record_uid TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    model TEXT NOT NULL,
    prompt_tokens BIGINT NOT NULL,
    completion_tokens BIGINT NOT NULL,
    estimated BOOLEAN NOT NULL DEFAULT FALSE,
    ts BIGINT NOT NULL
);";

pub const DDL_INDEX_USAGE_USER_MODEL: &str = "\
CREATE INDEX IF NOT EXISTS idx_usage_user_model ON usage_records(user_id, model, ts);";

/// All DDL statements for schema version 1, in order.
pub const SCHEMA_V1: &[&str] = &[
    DDL_SCHEMA_VERSION,
    DDL_MESSAGES,
    DDL_ACCOUNTS,
    DDL_USAGE_RECORDS,
    DDL_INDEX_USAGE_USER_MODEL,
];

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Migration support
// ---------------------------------------------------------------------------

/// Apply schema migrations up to `CURRENT_VERSION`.
///
/// Uses `schema_version` table for idempotent version tracking.
/// Returns the version that was applied (or the already-current version).
pub fn apply_migrations(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    conn.execute_batch(DDL_SCHEMA_VERSION)
        .map_err(MigrationError::Duckdb)?;

    let current = get_current_version(conn)?;

    if current >= CURRENT_VERSION {
        return Ok(current);
    }

    if current < 1 {
        for ddl in SCHEMA_V1 {
            conn.execute_batch(ddl).map_err(MigrationError::Duckdb)?;
        }
        record_version(conn, 1)?;
    }

    Ok(CURRENT_VERSION)
}

fn get_current_version(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .map_err(MigrationError::Duckdb)?;
    let version: i32 = stmt
        .query_row([], |row| row.get(0))
        .map_err(MigrationError::Duckdb)?;
    Ok(version)
}

fn record_version(conn: &duckdb::Connection, version: i32) -> Result<(), MigrationError> {
    let now_ms = chrono::Utc::now().timestamp_millis();
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        duckdb::params![version, now_ms],
    )
    .map_err(MigrationError::Duckdb)?;
    Ok(())
}

/// Deterministic record UID: sha256(user + ts + model + tokens), first 16 hex chars.
/// A replayed record with identical fields collides on the primary key instead
/// of double-counting a free-daily call.
pub fn usage_uid(
    user_id: &str,
    ts: i64,
    model: &str,
    prompt_tokens: u64,
    completion_tokens: u64,
) -> String {
    use sha2::{Digest, Sha256};
    let input = format!("{user_id}\u{1f}{ts}\u{1f}{model}\u{1f}{prompt_tokens}\u{1f}{completion_tokens}");
    let hash = Sha256::digest(input.as_bytes());
    hex::encode(&hash[..8])
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum MigrationError {
    Duckdb(duckdb::Error),
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Duckdb(e) => write!(f, "DuckDB migration error: {e}"),
        }
    }
}

impl std::error::Error for MigrationError {}
