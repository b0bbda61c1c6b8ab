//! SQLite access for the snapshot ledger
//!
//! ## Tables
//!
//! - `snapshots` - one row per cache key
//! - `snapshot_tags` - ordered tag list per key, indexed by tag
//!
//! Every function here is synchronous; `SnapshotStore` runs them on the
//! blocking pool.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use super::error::{db_err, SnapshotError};
use super::model::{SnapshotFilter, SnapshotMetadata, SnapshotStats, SnapshotUpdate};
use super::schema;

/// SQLite database holding the ledger
pub struct SnapshotDb {
    conn: Mutex<Connection>,
}

impl SnapshotDb {
    /// Open or create `snapshots.db` under `storage_dir`
    pub fn open(storage_dir: &Path) -> Result<Self, SnapshotError> {
        std::fs::create_dir_all(storage_dir)?;
        let db_path = storage_dir.join("snapshots.db");
        info!("Opening snapshot database at {:?}", db_path);

        let conn = Connection::open(&db_path).map_err(db_err("open snapshot database"))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=2000;",
        )
        .map_err(db_err("set PRAGMA"))?;

        Self::with_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, SnapshotError> {
        debug!("Opening in-memory snapshot database");
        let conn = Connection::open_in_memory().map_err(db_err("open in-memory database"))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(db_err("set PRAGMA"))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, SnapshotError> {
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T, SnapshotError>
    where
        F: FnOnce(&Connection) -> Result<T, SnapshotError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SnapshotError::Lock(e.to_string()))?;
        f(&conn)
    }

    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, SnapshotError>
    where
        F: FnOnce(&mut Connection) -> Result<T, SnapshotError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| SnapshotError::Lock(e.to_string()))?;
        f(&mut conn)
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn from_row(row: &Row) -> Result<SnapshotMetadata, rusqlite::Error> {
    let status: i64 = row.get("status_code")?;
    let size: i64 = row.get("response_size")?;
    let accesses: i64 = row.get("access_count")?;
    let last_accessed: Option<i64> = row.get("last_accessed_at")?;
    Ok(SnapshotMetadata {
        cache_key: row.get("cache_key")?,
        url: row.get("url")?,
        method: row.get("method")?,
        status_code: status.clamp(0, u16::MAX as i64) as u16,
        created_at: from_millis(row.get("created_at")?),
        expires_at: from_millis(row.get("expires_at")?),
        manual_snapshot: row.get("manual_snapshot")?,
        backend_host: row.get("backend_host")?,
        payload_hash: row.get("payload_hash")?,
        headers_hash: row.get("headers_hash")?,
        request_body: row.get("request_body")?,
        response_size: size.max(0) as u64,
        content_type: row.get("content_type")?,
        tags: Vec::new(),
        description: row.get("description")?,
        last_accessed_at: last_accessed.map(from_millis),
        access_count: accesses.max(0) as u64,
    })
}

fn get_tags(conn: &Connection, cache_key: &str) -> Result<Vec<String>, SnapshotError> {
    let mut stmt = conn
        .prepare("SELECT tag FROM snapshot_tags WHERE cache_key = ? ORDER BY position")
        .map_err(db_err("prepare tag query"))?;
    let tags = stmt
        .query_map(params![cache_key], |row| row.get(0))
        .map_err(db_err("query tags"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(db_err("read tag row"))?;
    Ok(tags)
}

fn replace_tags(conn: &Connection, cache_key: &str, tags: &[String]) -> Result<(), SnapshotError> {
    conn.execute("DELETE FROM snapshot_tags WHERE cache_key = ?", params![cache_key])
        .map_err(db_err("clear tags"))?;
    for (position, tag) in tags.iter().enumerate() {
        conn.execute(
            "INSERT INTO snapshot_tags (cache_key, position, tag) VALUES (?, ?, ?)",
            params![cache_key, position as i64, tag],
        )
        .map_err(db_err("insert tag"))?;
    }
    Ok(())
}

/// Fetch one row with its tags
pub fn get_snapshot(conn: &Connection, cache_key: &str) -> Result<Option<SnapshotMetadata>, SnapshotError> {
    let row = conn
        .query_row(
            "SELECT * FROM snapshots WHERE cache_key = ?",
            params![cache_key],
            from_row,
        )
        .optional()
        .map_err(db_err("select snapshot"))?;

    match row {
        Some(mut meta) => {
            meta.tags = get_tags(conn, cache_key)?;
            Ok(Some(meta))
        }
        None => Ok(None),
    }
}

/// Insert or refresh the row for `meta.cache_key`.
///
/// Provenance fields and the expiry window are overwritten. The manual flag,
/// description and access statistics belong to the existing row and are kept.
/// Tags are replaced only when `meta.tags` is non-empty.
pub fn upsert_snapshot(conn: &mut Connection, meta: &SnapshotMetadata) -> Result<(), SnapshotError> {
    let tx = conn.transaction().map_err(db_err("begin upsert"))?;

    tx.execute(
        r#"
        INSERT INTO snapshots (
            cache_key, url, method, status_code, created_at, expires_at,
            manual_snapshot, backend_host, payload_hash, headers_hash,
            request_body, response_size, content_type, description,
            last_accessed_at, access_count
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(cache_key) DO UPDATE SET
            url = excluded.url,
            method = excluded.method,
            status_code = excluded.status_code,
            created_at = excluded.created_at,
            expires_at = excluded.expires_at,
            backend_host = excluded.backend_host,
            payload_hash = excluded.payload_hash,
            headers_hash = excluded.headers_hash,
            request_body = excluded.request_body,
            response_size = excluded.response_size,
            content_type = excluded.content_type
        "#,
        params![
            meta.cache_key,
            meta.url,
            meta.method,
            meta.status_code as i64,
            to_millis(meta.created_at),
            to_millis(meta.expires_at),
            meta.manual_snapshot,
            meta.backend_host,
            meta.payload_hash,
            meta.headers_hash,
            meta.request_body,
            meta.response_size as i64,
            meta.content_type,
            meta.description,
            meta.last_accessed_at.map(to_millis),
            meta.access_count as i64,
        ],
    )
    .map_err(db_err("upsert snapshot"))?;

    if !meta.tags.is_empty() {
        replace_tags(&tx, &meta.cache_key, &meta.tags)?;
    }

    tx.commit().map_err(db_err("commit upsert"))?;
    Ok(())
}

/// Bump the access counter. Returns false when no row exists.
pub fn touch_access(conn: &Connection, cache_key: &str, now: DateTime<Utc>) -> Result<bool, SnapshotError> {
    let changed = conn
        .execute(
            "UPDATE snapshots SET access_count = access_count + 1, last_accessed_at = ? WHERE cache_key = ?",
            params![to_millis(now), cache_key],
        )
        .map_err(db_err("touch snapshot"))?;
    Ok(changed > 0)
}

/// Build the WHERE clause shared by `list_snapshots` and `count_snapshots`
fn filter_clause(filter: &SnapshotFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut conditions: Vec<String> = vec![];
    let mut params: Vec<Box<dyn ToSql>> = vec![];

    if let Some(ref method) = filter.method {
        conditions.push("s.method = ?".to_string());
        params.push(Box::new(method.to_ascii_uppercase()));
    }
    if let Some(ref url) = filter.url {
        conditions.push("instr(s.url, ?) > 0".to_string());
        params.push(Box::new(url.clone()));
    }
    if let Some(ref host) = filter.backend_host {
        conditions.push("s.backend_host = ?".to_string());
        params.push(Box::new(host.clone()));
    }
    if let Some(manual) = filter.manual {
        conditions.push("s.manual_snapshot = ?".to_string());
        params.push(Box::new(manual));
    }

    let ranges = [
        ("s.created_at >= ?", filter.created_after),
        ("s.created_at <= ?", filter.created_before),
        ("s.expires_at >= ?", filter.expires_after),
        ("s.expires_at <= ?", filter.expires_before),
    ];
    for (condition, bound) in ranges {
        if let Some(t) = bound {
            conditions.push(condition.to_string());
            params.push(Box::new(to_millis(t)));
        }
    }

    if !filter.tags.is_empty() {
        let placeholders: Vec<_> = filter.tags.iter().map(|_| "?").collect();
        conditions.push(format!(
            "s.cache_key IN (SELECT cache_key FROM snapshot_tags WHERE tag IN ({}))",
            placeholders.join(", ")
        ));
        for tag in &filter.tags {
            params.push(Box::new(tag.clone()));
        }
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    (clause, params)
}

/// Filtered rows, newest first
pub fn list_snapshots(conn: &Connection, filter: &SnapshotFilter) -> Result<Vec<SnapshotMetadata>, SnapshotError> {
    let (clause, mut params) = filter_clause(filter);
    let sql = format!(
        "SELECT s.* FROM snapshots s{} ORDER BY s.created_at DESC, s.cache_key LIMIT ? OFFSET ?",
        clause
    );
    params.push(Box::new(filter.limit as i64));
    params.push(Box::new(filter.offset as i64));

    debug!("Executing query: {}", sql);

    let mut stmt = conn.prepare(&sql).map_err(db_err("prepare list"))?;
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), from_row)
        .map_err(db_err("query list"))?;

    let mut results = vec![];
    for row in rows {
        let mut meta = row.map_err(db_err("read list row"))?;
        meta.tags = get_tags(conn, &meta.cache_key)?;
        results.push(meta);
    }
    Ok(results)
}

/// Number of rows matching the filter (ignoring limit/offset)
pub fn count_snapshots(conn: &Connection, filter: &SnapshotFilter) -> Result<u64, SnapshotError> {
    let (clause, params) = filter_clause(filter);
    let sql = format!("SELECT COUNT(*) FROM snapshots s{}", clause);
    let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
    let count: i64 = conn
        .query_row(&sql, param_refs.as_slice(), |row| row.get(0))
        .map_err(db_err("count snapshots"))?;
    Ok(count.max(0) as u64)
}

/// Apply a partial update. TTL extensions are added to the current (or
/// newly supplied) `expires_at`, so repeated extensions compound.
pub fn update_snapshot(
    conn: &mut Connection,
    cache_key: &str,
    update: &SnapshotUpdate,
) -> Result<Option<SnapshotMetadata>, SnapshotError> {
    let tx = conn.transaction().map_err(db_err("begin update"))?;

    let Some(current) = get_snapshot(&tx, cache_key)? else {
        return Ok(None);
    };

    let mut expires_at = update.expires_at.unwrap_or(current.expires_at);
    if let Some(hours) = update.ttl_extension_hours {
        expires_at += ChronoDuration::milliseconds((hours * 3_600_000.0).round() as i64);
    }
    let manual = update.manual_snapshot.unwrap_or(current.manual_snapshot);
    let description = update.description.clone().or(current.description);

    tx.execute(
        "UPDATE snapshots SET expires_at = ?, manual_snapshot = ?, description = ? WHERE cache_key = ?",
        params![to_millis(expires_at), manual, description, cache_key],
    )
    .map_err(db_err("update snapshot"))?;

    if let Some(ref tags) = update.tags {
        replace_tags(&tx, cache_key, tags)?;
    }

    let updated = get_snapshot(&tx, cache_key)?;
    tx.commit().map_err(db_err("commit update"))?;
    Ok(updated)
}

pub fn delete_snapshot(conn: &Connection, cache_key: &str) -> Result<bool, SnapshotError> {
    let removed = conn
        .execute("DELETE FROM snapshots WHERE cache_key = ?", params![cache_key])
        .map_err(db_err("delete snapshot"))?;
    Ok(removed > 0)
}

/// Delete expired rows that are not manual snapshots
pub fn clean_expired(conn: &Connection, now: DateTime<Utc>) -> Result<usize, SnapshotError> {
    conn.execute(
        "DELETE FROM snapshots WHERE expires_at <= ? AND manual_snapshot = 0",
        params![to_millis(now)],
    )
    .map_err(db_err("clean expired snapshots"))
}

/// Delete every non-manual row
pub fn clear_non_manual(conn: &Connection) -> Result<usize, SnapshotError> {
    conn.execute("DELETE FROM snapshots WHERE manual_snapshot = 0", [])
        .map_err(db_err("clear snapshots"))
}

/// Keys whose tag list intersects `tags`
pub fn keys_with_any_tag(conn: &Connection, tags: &[String]) -> Result<Vec<String>, SnapshotError> {
    if tags.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders: Vec<_> = tags.iter().map(|_| "?").collect();
    let sql = format!(
        "SELECT DISTINCT cache_key FROM snapshot_tags WHERE tag IN ({}) ORDER BY cache_key",
        placeholders.join(", ")
    );
    let param_refs: Vec<&dyn ToSql> = tags.iter().map(|t| t as &dyn ToSql).collect();

    let mut stmt = conn.prepare(&sql).map_err(db_err("prepare tag lookup"))?;
    let keys = stmt
        .query_map(param_refs.as_slice(), |row| row.get(0))
        .map_err(db_err("query tag lookup"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(db_err("read tag lookup row"))?;
    Ok(keys)
}

pub fn snapshot_stats(conn: &Connection, now: DateTime<Utc>) -> Result<SnapshotStats, SnapshotError> {
    let (total, manual, expired, size, accesses, hosts): (i64, i64, i64, i64, i64, i64) = conn
        .query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(manual_snapshot), 0),
                COALESCE(SUM(CASE WHEN expires_at <= ? THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(response_size), 0),
                COALESCE(SUM(access_count), 0),
                COUNT(DISTINCT backend_host)
            FROM snapshots
            "#,
            params![to_millis(now)],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
        )
        .map_err(db_err("aggregate snapshots"))?;

    let unique_tags: i64 = conn
        .query_row("SELECT COUNT(DISTINCT tag) FROM snapshot_tags", [], |row| row.get(0))
        .map_err(db_err("count tags"))?;

    Ok(SnapshotStats {
        total: total.max(0) as u64,
        manual: manual.max(0) as u64,
        expired: expired.max(0) as u64,
        total_size_bytes: size.max(0) as u64,
        total_accesses: accesses.max(0) as u64,
        unique_tags: unique_tags.max(0) as u64,
        backend_hosts: hosts.max(0) as u64,
    })
}
