//! Conditional-GET response cache rows.
//!
//! Keyed by the hex SHA-256 of `"{METHOD} {url} accept={accept}"`. Bodies are
//! stored as raw bytes; entity tags round-trip verbatim.

use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};

use super::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct HttpCacheEntry {
    pub key: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: i64,
    pub expires_at: Option<i64>,
}

/// Cache key for a request.
pub fn cache_key(method: &str, url: &str, accept: &str) -> String {
    let material = format!("{method} {url} accept={accept}");
    let digest = Sha256::digest(material.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl Store {
    pub fn get_http_cache(&self, key: &str) -> Result<Option<HttpCacheEntry>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT key, method, url, status, etag, last_modified, body, \
                            fetched_at, expires_at \
                     FROM http_cache WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok(HttpCacheEntry {
                            key: row.get(0)?,
                            method: row.get(1)?,
                            url: row.get(2)?,
                            status: row.get::<_, i64>(3)? as u16,
                            etag: row.get(4)?,
                            last_modified: row.get(5)?,
                            body: row.get(6)?,
                            fetched_at: row.get(7)?,
                            expires_at: row.get(8)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    pub fn put_http_cache(&self, entry: &HttpCacheEntry) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO http_cache \
                 (key, method, url, status, etag, last_modified, body, fetched_at, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(key) DO UPDATE SET \
                   status = excluded.status, \
                   etag = excluded.etag, \
                   last_modified = excluded.last_modified, \
                   body = excluded.body, \
                   fetched_at = excluded.fetched_at, \
                   expires_at = excluded.expires_at",
                params![
                    entry.key,
                    entry.method,
                    entry.url,
                    entry.status as i64,
                    entry.etag,
                    entry.last_modified,
                    entry.body,
                    entry.fetched_at,
                    entry.expires_at,
                ],
            )?;
            Ok(())
        })
    }

    /// A 304 revalidation: advance `fetched_at`, leave the body untouched.
    pub fn touch_http_cache(&self, key: &str, fetched_at: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE http_cache SET fetched_at = ?1 WHERE key = ?2",
                params![fetched_at, key],
            )?;
            Ok(())
        })
    }

    /// Delete cache rows fetched before the cutoff. Returns rows removed.
    pub fn prune_http_cache(&self, cutoff_ts: i64) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM http_cache WHERE fetched_at < ?1",
                params![cutoff_ts],
            )?)
        })
    }
}
