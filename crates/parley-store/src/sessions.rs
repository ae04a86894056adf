use chrono::{DateTime, Utc};
use tracing::instrument;

use parley_core::ids::{SessionId, UserId};
use parley_core::messages::Session;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

const SESSION_COLUMNS: &str = "id, user_id, model, created_at, updated_at";

#[derive(Clone)]
pub struct SessionRepo {
    db: Database,
}

impl SessionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a session row. Fails with `Conflict` if the id is taken.
    #[instrument(skip(self, session), fields(session_id = %session.id, user_id = %session.user_id))]
    pub fn create(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO sessions (id, user_id, model, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    session.id.as_str(),
                    session.user_id.as_str(),
                    session.model,
                    row_helpers::format_timestamp(&session.created_at),
                    row_helpers::format_timestamp(&session.updated_at),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::Conflict(format!("session {} exists", session.id)));
            }
            Ok(())
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn get(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_session(row)?)),
                None => Ok(None),
            }
        })
    }

    /// Sessions owned by `user_id`, most recently updated first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1
                 ORDER BY updated_at DESC, id DESC"
            ))?;
            let mut rows = stmt.query([user_id.as_str()])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_session(row)?);
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(session_id = %id))]
    pub fn touch(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
                rusqlite::params![row_helpers::format_timestamp(&Utc::now()), id.as_str()],
            )?;
            Ok(())
        })
    }

    /// Delete a session and (by cascade) its messages.
    #[instrument(skip(self), fields(session_id = %id))]
    pub fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE id = ?1", [id.as_str()])?;
            Ok(n > 0)
        })
    }

    /// Delete sessions not updated since `cutoff`. Returns the purged ids.
    #[instrument(skip(self))]
    pub fn purge_updated_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StoreError> {
        self.db.with_conn(|conn| {
            let cutoff = row_helpers::format_timestamp(&cutoff);
            let mut stmt = conn.prepare("SELECT id FROM sessions WHERE updated_at < ?1")?;
            let ids: Vec<String> = stmt
                .query_map([&cutoff], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            conn.execute("DELETE FROM sessions WHERE updated_at < ?1", [&cutoff])?;
            Ok(ids.into_iter().map(SessionId::from_raw).collect())
        })
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        self.db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?))
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let id: String = row_helpers::get(row, 0, "sessions", "id")?;
    let user_id: String = row_helpers::get(row, 1, "sessions", "user_id")?;
    let created_at: String = row_helpers::get(row, 3, "sessions", "created_at")?;
    let updated_at: String = row_helpers::get(row, 4, "sessions", "updated_at")?;
    Ok(Session {
        id: SessionId::from_raw(id),
        user_id: UserId::from_raw(user_id),
        model: row_helpers::get(row, 2, "sessions", "model")?,
        created_at: row_helpers::parse_timestamp(&created_at, "sessions", "created_at")?,
        updated_at: row_helpers::parse_timestamp(&updated_at, "sessions", "updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn setup() -> SessionRepo {
        SessionRepo::new(Database::in_memory().unwrap())
    }

    fn session(id: &str, user: &str) -> Session {
        Session::new(SessionId::from_raw(id), UserId::from_raw(user), "gpt-test")
    }

    #[test]
    fn create_and_get() {
        let repo = setup();
        let s = session("s1", "alice");
        repo.create(&s).unwrap();
        let loaded = repo.get(&s.id).unwrap().unwrap();
        assert_eq!(loaded.user_id.as_str(), "alice");
        assert_eq!(loaded.model, "gpt-test");
        assert_eq!(loaded.created_at.timestamp(), s.created_at.timestamp());
    }

    #[test]
    fn get_missing_is_none() {
        let repo = setup();
        assert!(repo.get(&SessionId::from_raw("nope")).unwrap().is_none());
    }

    #[test]
    fn duplicate_create_conflicts() {
        let repo = setup();
        repo.create(&session("s1", "alice")).unwrap();
        let err = repo.create(&session("s1", "bob")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn list_is_scoped_to_user() {
        let repo = setup();
        repo.create(&session("a1", "alice")).unwrap();
        repo.create(&session("a2", "alice")).unwrap();
        repo.create(&session("b1", "bob")).unwrap();
        let alice = repo.list_for_user(&UserId::from_raw("alice")).unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|s| s.user_id.as_str() == "alice"));
    }

    #[test]
    fn delete_reports_existence() {
        let repo = setup();
        repo.create(&session("s1", "alice")).unwrap();
        assert!(repo.delete(&SessionId::from_raw("s1")).unwrap());
        assert!(!repo.delete(&SessionId::from_raw("s1")).unwrap());
        assert_eq!(repo.count().unwrap(), 0);
    }

    #[test]
    fn purge_removes_only_stale_sessions() {
        let repo = setup();
        let mut stale = session("old", "alice");
        stale.updated_at = Utc::now() - Duration::days(40);
        repo.create(&stale).unwrap();
        repo.create(&session("fresh", "alice")).unwrap();

        let purged = repo.purge_updated_before(Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(purged, vec![SessionId::from_raw("old")]);
        assert!(repo.get(&SessionId::from_raw("fresh")).unwrap().is_some());
    }
}
