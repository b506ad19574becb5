//! Enrolled signatures, persisted in the system database.
//!
//! This is the roster side of the gallery: the daemon writes here when a
//! photo is enrolled or an identity removed, then invalidates the group's
//! cached gallery, which is rebuilt from this table on next use.

use rollcall_core::{Gallery, GalleryError, GallerySource, Signature};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("empty signature")]
    EmptySignature,
}

pub struct EnrollmentStore {
    conn: Mutex<Connection>,
}

impl EnrollmentStore {
    pub fn open(path: &Path) -> Result<Self, EnrollmentError> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, EnrollmentError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, EnrollmentError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signatures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                group_name TEXT NOT NULL,
                identity TEXT NOT NULL,
                signature BLOB NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS signatures_group ON signatures(group_name);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store one more signature for `identity`. Returns the row id.
    pub fn add_signature(
        &self,
        group: &str,
        identity: &str,
        signature: &Signature,
    ) -> Result<i64, EnrollmentError> {
        if signature.values.is_empty() {
            return Err(EnrollmentError::EmptySignature);
        }
        let conn = self.conn();
        conn.execute(
            "INSERT INTO signatures (group_name, identity, signature, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                group,
                identity,
                signature.to_bytes(),
                chrono::Local::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Remove every signature of `identity`. Returns how many were removed.
    pub fn remove_identity(&self, group: &str, identity: &str) -> Result<usize, EnrollmentError> {
        let removed = self.conn().execute(
            "DELETE FROM signatures WHERE group_name = ?1 AND identity = ?2",
            params![group, identity],
        )?;
        Ok(removed)
    }

    /// Distinct enrolled identities of a group, sorted.
    pub fn identities(&self, group: &str) -> Result<Vec<String>, EnrollmentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT identity FROM signatures WHERE group_name = ?1 ORDER BY identity",
        )?;
        let rows = stmt.query_map(params![group], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Groups with at least one enrolled signature.
    pub fn groups(&self) -> Result<Vec<String>, EnrollmentError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT DISTINCT group_name FROM signatures ORDER BY group_name")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn load_gallery(&self, group: &str) -> Result<Gallery, EnrollmentError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT identity, signature FROM signatures WHERE group_name = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![group], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        // Every signature of a group must have the length of the first one.
        let mut gallery = Gallery::new();
        let mut dim = None;
        for row in rows {
            let (identity, blob) = row?;
            let signature = match Signature::from_bytes(&blob) {
                Some(s) if !s.values.is_empty() => s,
                _ => {
                    let bytes = blob.len();
                    tracing::warn!(group, identity, bytes, "skipping malformed signature blob");
                    continue;
                }
            };
            let expected = *dim.get_or_insert(signature.values.len());
            if signature.values.len() != expected {
                tracing::warn!(
                    group,
                    identity,
                    len = signature.values.len(),
                    expected,
                    "skipping signature of unexpected length"
                );
                continue;
            }
            gallery.push(identity, signature);
        }
        Ok(gallery)
    }
}

impl GallerySource for EnrollmentStore {
    fn build(&self, group: &str) -> Result<Gallery, GalleryError> {
        self.load_gallery(group).map_err(|e| GalleryError::Build {
            group: group.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(v: f32) -> Signature {
        Signature::new(vec![v, v])
    }

    #[test]
    fn test_build_returns_signatures_in_enrollment_order() {
        let store = EnrollmentStore::in_memory().unwrap();
        store.add_signature("g1", "bob", &sig(1.0)).unwrap();
        store.add_signature("g1", "alice", &sig(2.0)).unwrap();
        store.add_signature("g1", "bob", &sig(3.0)).unwrap();
        store.add_signature("g2", "zed", &sig(4.0)).unwrap();

        let gallery = store.build("g1").unwrap();
        assert_eq!(gallery.identities(), &["bob", "alice", "bob"]);
        assert_eq!(gallery.signatures()[2], sig(3.0));
    }

    #[test]
    fn test_remove_identity() {
        let store = EnrollmentStore::in_memory().unwrap();
        store.add_signature("g1", "bob", &sig(1.0)).unwrap();
        store.add_signature("g1", "bob", &sig(2.0)).unwrap();
        store.add_signature("g1", "carol", &sig(3.0)).unwrap();

        assert_eq!(store.remove_identity("g1", "bob").unwrap(), 2);
        assert_eq!(store.identities("g1").unwrap(), vec!["carol".to_string()]);
        assert_eq!(store.remove_identity("g1", "bob").unwrap(), 0);
    }

    #[test]
    fn test_groups_and_empty_build() {
        let store = EnrollmentStore::in_memory().unwrap();
        assert!(store.build("nobody").unwrap().is_empty());
        store.add_signature("b", "x", &sig(1.0)).unwrap();
        store.add_signature("a", "y", &sig(1.0)).unwrap();
        assert_eq!(store.groups().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_build_skips_short_and_empty_blobs() {
        let store = EnrollmentStore::in_memory().unwrap();
        store.add_signature("g1", "alice", &sig(1.0)).unwrap();
        assert!(store
            .add_signature("g1", "ghost", &Signature::new(Vec::new()))
            .is_err());
        {
            let conn = store.conn();
            for blob in [Vec::new(), 1.0f32.to_le_bytes().to_vec()] {
                conn.execute(
                    "INSERT INTO signatures (group_name, identity, signature, created_at)
                     VALUES ('g1', 'mallory', ?1, '')",
                    params![blob],
                )
                .unwrap();
            }
        }
        store.add_signature("g1", "bob", &sig(2.0)).unwrap();

        let gallery = store.build("g1").unwrap();
        assert_eq!(gallery.identities(), &["alice", "bob"]);
    }
}
