//! Snapshot ledger schema

use rusqlite::Connection;
use tracing::info;

use super::error::{db_err, SnapshotError};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Create or migrate the schema
pub fn init_schema(conn: &Connection) -> Result<(), SnapshotError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating snapshot schema v{}", SCHEMA_VERSION);
        conn.execute_batch(SNAPSHOT_SCHEMA)
            .map_err(db_err("create snapshot tables"))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating snapshot schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32, SnapshotError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(db_err("create schema_version table"))?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), SnapshotError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(db_err("clear schema_version"))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(db_err("set schema_version"))?;
    Ok(())
}

/// Timestamps are unix milliseconds
const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    cache_key TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    status_code INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    manual_snapshot INTEGER NOT NULL DEFAULT 0,
    backend_host TEXT NOT NULL DEFAULT '',
    payload_hash TEXT,
    headers_hash TEXT,
    request_body TEXT,
    response_size INTEGER NOT NULL DEFAULT 0,
    content_type TEXT,
    description TEXT,
    last_accessed_at INTEGER,
    access_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS snapshot_tags (
    cache_key TEXT NOT NULL REFERENCES snapshots(cache_key) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (cache_key, position)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_created ON snapshots(created_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_expires ON snapshots(expires_at);
CREATE INDEX IF NOT EXISTS idx_snapshots_host ON snapshots(backend_host);
CREATE INDEX IF NOT EXISTS idx_snapshot_tags_tag ON snapshot_tags(tag);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }
}
