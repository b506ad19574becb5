//! Credential verification and fixed-window rate limiting.
//!
//! Device credentials are random keys bound to one group. Only their
//! SHA-256 hashes are stored; the in-memory table maps hash → group and is
//! reloaded whenever a key is issued or revoked.

use rand::RngCore;
use rusqlite::{params, Connection};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Bucket count above which expired buckets are swept on insert.
const BUCKET_SWEEP_THRESHOLD: usize = 4096;
/// Hard ceiling on live buckets. New keys are refused once it is reached.
const MAX_BUCKETS: usize = 16_384;

#[derive(Error, Debug)]
pub enum AccessError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Listing entry for an issued key. The key itself is never recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub fingerprint: String,
    pub group: String,
    pub device: String,
    pub created_at: String,
    pub active: bool,
}

struct RateBucket {
    window_start: Instant,
    count: u32,
}

pub struct AccessGuard {
    conn: Mutex<Connection>,
    credentials: RwLock<HashMap<String, String>>,
    buckets: Mutex<HashMap<String, RateBucket>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn hash_credential(credential: &str) -> String {
    format!("{:x}", Sha256::digest(credential.as_bytes()))
}

/// Short, non-secret identifier of a credential, safe for logs.
pub fn fingerprint(credential: &str) -> String {
    hash_credential(credential)[..12].to_string()
}

impl AccessGuard {
    pub fn open(path: &Path) -> Result<Self, AccessError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, AccessError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AccessError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key_hash TEXT UNIQUE NOT NULL,
                group_name TEXT NOT NULL,
                device_name TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );",
        )?;
        let guard = Self {
            conn: Mutex::new(conn),
            credentials: RwLock::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
        };
        guard.reload()?;
        Ok(guard)
    }

    /// Replace the in-memory table with the active keys from storage.
    pub fn reload(&self) -> Result<usize, AccessError> {
        let table: HashMap<String, String> = {
            let conn = lock(&self.conn);
            let mut stmt =
                conn.prepare("SELECT key_hash, group_name FROM api_keys WHERE is_active = 1")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<_, _>>()?
        };
        let count = table.len();
        *self.credentials.write().unwrap_or_else(|e| e.into_inner()) = table;
        tracing::info!(count, "credential table loaded");
        Ok(count)
    }

    /// Whether `credential` is active and bound to `group`.
    pub fn verify(&self, credential: &str, group: &str) -> bool {
        if credential.is_empty() {
            return false;
        }
        let hash = hash_credential(credential);
        self.credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&hash)
            .is_some_and(|g| g == group)
    }

    /// Whether any active credential is bound to `group`.
    pub fn knows_group(&self, group: &str) -> bool {
        self.credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|g| g == group)
    }

    /// Create a new key for a device in `group`. The plain key is returned
    /// once and never stored.
    pub fn issue(&self, group: &str, device: &str) -> Result<String, AccessError> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key: String = bytes.iter().map(|b| format!("{b:02x}")).collect();

        lock(&self.conn).execute(
            "INSERT INTO api_keys (key_hash, group_name, device_name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                hash_credential(&key),
                group,
                device,
                chrono::Local::now().to_rfc3339()
            ],
        )?;
        self.reload()?;
        tracing::info!(group, device, fingerprint = %fingerprint(&key), "credential issued");
        Ok(key)
    }

    /// Deactivate a key. Returns `false` if it was unknown or already revoked.
    pub fn revoke(&self, credential: &str) -> Result<bool, AccessError> {
        let changed = lock(&self.conn).execute(
            "UPDATE api_keys SET is_active = 0 WHERE key_hash = ?1 AND is_active = 1",
            params![hash_credential(credential)],
        )?;
        self.reload()?;
        if changed > 0 {
            tracing::info!(fingerprint = %fingerprint(credential), "credential revoked");
        }
        Ok(changed > 0)
    }

    pub fn list(&self, group: &str) -> Result<Vec<KeyInfo>, AccessError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            "SELECT key_hash, group_name, device_name, created_at, is_active
             FROM api_keys WHERE group_name = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![group], |row| {
            let hash: String = row.get(0)?;
            Ok(KeyInfo {
                fingerprint: hash.chars().take(12).collect(),
                group: row.get(1)?,
                device: row.get(2)?,
                created_at: row.get(3)?,
                active: row.get::<_, i64>(4)? != 0,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Fixed-window limiter: allow at most `limit` calls per `window` for `key`.
    pub fn rate_limit(&self, key: &str, limit: u32, window: Duration) -> bool {
        self.rate_limit_at(key, limit, window, Instant::now())
    }

    fn rate_limit_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> bool {
        let mut buckets = lock(&self.buckets);
        if buckets.len() > BUCKET_SWEEP_THRESHOLD {
            buckets.retain(|_, b| now.duration_since(b.window_start) < window);
        }
        if buckets.len() >= MAX_BUCKETS && !buckets.contains_key(key) {
            tracing::warn!(buckets = buckets.len(), "rate limiter full, refusing new key");
            return false;
        }

        let bucket = buckets.entry(key.to_string()).or_insert(RateBucket {
            window_start: now,
            count: 0,
        });
        if now.duration_since(bucket.window_start) >= window {
            bucket.window_start = now;
            bucket.count = 0;
        }
        if bucket.count >= limit {
            return false;
        }
        bucket.count += 1;
        true
    }

    /// Whether `key` has used up its budget for the current window.
    /// Unlike [`rate_limit`](Self::rate_limit) this does not count a call.
    pub fn exhausted(&self, key: &str, limit: u32, window: Duration) -> bool {
        self.exhausted_at(key, limit, window, Instant::now())
    }

    fn exhausted_at(&self, key: &str, limit: u32, window: Duration, now: Instant) -> bool {
        match lock(&self.buckets).get(key) {
            Some(b) => now.duration_since(b.window_start) < window && b.count >= limit,
            None => limit == 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn bucket_count(&self) -> usize {
        lock(&self.buckets).len()
    }
}
