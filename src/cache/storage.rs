//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CachedEntry, RequestKey};
use crate::http::{Response, ResponseKind};

/// Trait for cache storage backends.
///
/// A backend holds any number of named stores. Store names are cache
/// generation names; the gateway decides which of them is current.
pub trait CacheStorage: Send + Sync {
  /// Create the store if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Whether a store with this name exists.
  fn has(&self, name: &str) -> Result<bool>;

  /// Delete a store and every entry in it. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Names of all stores, in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  /// Look up a single entry in a store.
  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Insert or replace one entry in an existing store.
  ///
  /// Returns false and writes nothing if the store does not exist, so a
  /// deleted generation is never brought back by a late write.
  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<bool>;

  /// Insert a batch of entries. Either every entry is stored or none is.
  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  /// Request keys of every entry in a store, in insertion order.
  fn entries(&self, name: &str) -> Result<Vec<RequestKey>>;

  /// When the most recent entry of a store was written.
  fn last_written(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
    let mut newest = None;
    for key in self.entries(name)? {
      if let Some(entry) = self.match_entry(name, &key)? {
        newest = newest.max(Some(entry.cached_at));
      }
    }
    Ok(newest)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a storage that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("navgate").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per named store (cache generation)
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request
CREATE TABLE IF NOT EXISTS cache_entries (
    store_name TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    response_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    kind TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store_name, entry_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_store ON cache_entries(store_name);
"#;

fn ensure_store(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create cache store {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  name: &str,
  key: &RequestKey,
  response: &Response,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
  let kind =
    serde_json::to_string(&response.kind).map_err(|e| eyre!("Failed to serialize kind: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (store_name, entry_key, method, url, response_url, status, status_text, headers, kind, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        key.cache_hash(),
        key.method,
        key.url,
        response.url,
        response.status,
        response.status_text,
        headers,
        kind,
        response.body,
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key.url, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.conn()?;
    ensure_store(&conn, name)
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self.conn()?;
    let found: Option<String> = conn
      .query_row(
        "SELECT name FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE store_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache store name: {}", e))?;

    Ok(names)
  }

  fn match_entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT response_url, status, status_text, headers, kind, body, cached_at
         FROM cache_entries WHERE store_name = ? AND entry_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(String, u16, String, String, String, Vec<u8>, String)> = stmt
      .query_row(params![name, key.cache_hash()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.url, e))?;

    let Some((url, status, status_text, headers, kind, body, cached_at)) = row else {
      return Ok(None);
    };

    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key.url, e))?;
    let kind: ResponseKind = serde_json::from_str(&kind)
      .map_err(|e| eyre!("Failed to deserialize kind of {}: {}", key.url, e))?;

    Ok(Some(CachedEntry {
      response: Response {
        url,
        status,
        status_text,
        headers,
        body,
        kind,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let exists: Option<i64> = tx
      .query_row(
        "SELECT 1 FROM cache_stores WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache store {}: {}", name, e))?;
    if exists.is_none() {
      return Ok(false);
    }

    insert_entry(&tx, name, key, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(true)
  }

  fn put_all(&self, name: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_store(&tx, name)?;
    for (key, response) in entries {
      // Dropping `tx` on error rolls the whole batch back
      insert_entry(&tx, name, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn entries(&self, name: &str) -> Result<Vec<RequestKey>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE store_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![name], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry of {}: {}", name, e))?;

    Ok(keys)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
