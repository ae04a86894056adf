use bytes::Bytes;
use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::instrument;

use parley_core::collaborators::Blob;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Keyed binary objects. Writes to an existing key replace it.
#[derive(Clone)]
pub struct BlobRepo {
    db: Database,
}

impl BlobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub fn put(&self, key: &str, content_type: &str, data: &[u8]) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO blobs (key, content_type, data, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(key) DO UPDATE SET
                    content_type = excluded.content_type,
                    data = excluded.data,
                    created_at = excluded.created_at",
                rusqlite::params![
                    key,
                    content_type,
                    data,
                    row_helpers::format_timestamp(&Utc::now())
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self))]
    pub fn get(&self, key: &str) -> Result<Option<Blob>, StoreError> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT content_type, data FROM blobs WHERE key = ?1",
                    [key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
                )
                .optional()?;
            Ok(row.map(|(content_type, data)| Blob {
                content_type,
                data: Bytes::from(data),
            }))
        })
    }

    /// Keys starting with `prefix`, sorted.
    #[instrument(skip(self))]
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}%", row_helpers::escape_like(prefix));
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key FROM blobs WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key ASC")?;
            let keys = stmt
                .query_map([pattern], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            // LIKE is case-insensitive for ASCII; keys are not.
            Ok(keys.into_iter().filter(|k| k.starts_with(prefix)).collect())
        })
    }

    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.execute("DELETE FROM blobs WHERE key = ?1", [key])? > 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> BlobRepo {
        BlobRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn put_get_and_overwrite() {
        let repo = repo();
        repo.put("u/alice/notes", "text/plain", b"v1").unwrap();
        repo.put("u/alice/notes", "application/json", b"{}").unwrap();
        let blob = repo.get("u/alice/notes").unwrap().unwrap();
        assert_eq!(blob.content_type, "application/json");
        assert_eq!(&blob.data[..], b"{}");
        assert!(repo.get("u/alice/missing").unwrap().is_none());
    }

    #[test]
    fn list_matches_prefix_exactly() {
        let repo = repo();
        for key in ["u/alice/a", "u/alice/b", "u/alicex/c", "u/Alice/d", "u/bob/a"] {
            repo.put(key, "text/plain", b"x").unwrap();
        }
        assert_eq!(repo.list("u/alice/").unwrap(), vec!["u/alice/a", "u/alice/b"]);
        assert_eq!(repo.list("u/").unwrap().len(), 5);
    }

    #[test]
    fn list_escapes_wildcards() {
        let repo = repo();
        repo.put("u/a_1", "text/plain", b"x").unwrap();
        repo.put("u/ab1", "text/plain", b"x").unwrap();
        assert_eq!(repo.list("u/a_").unwrap(), vec!["u/a_1"]);
    }

    #[test]
    fn delete_reports_existence() {
        let repo = repo();
        repo.put("k", "text/plain", b"x").unwrap();
        assert!(repo.delete("k").unwrap());
        assert!(!repo.delete("k").unwrap());
    }
}
