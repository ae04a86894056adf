//! Async adapters exposing the SQLite repositories through the
//! collaborator traits. Each call runs on the blocking pool since the
//! connection mutex may be held across disk I/O.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use parley_core::collaborators::{Blob, BlobStore, MessageHit, RecordStore};
use parley_core::errors::StorageError;
use parley_core::ids::{SessionId, UserId};
use parley_core::messages::{Message, Session};

use crate::blobs::BlobRepo;
use crate::database::Database;
use crate::error::StoreError;
use crate::messages::MessageRepo;
use crate::sessions::SessionRepo;

async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Backend(format!("store task failed: {e}")))?
        .map_err(StorageError::from)
}

#[derive(Clone)]
pub struct SqliteRecordStore {
    sessions: SessionRepo,
    messages: MessageRepo,
}

impl SqliteRecordStore {
    pub fn new(db: Database) -> Self {
        Self {
            sessions: SessionRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }

    pub fn sessions(&self) -> &SessionRepo {
        &self.sessions
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create_session(&self, session: &Session) -> Result<(), StorageError> {
        let repo = self.sessions.clone();
        let session = session.clone();
        blocking(move || repo.create(&session)).await
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StorageError> {
        let repo = self.sessions.clone();
        let id = id.clone();
        blocking(move || repo.get(&id)).await
    }

    async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<Session>, StorageError> {
        let repo = self.sessions.clone();
        let user_id = user_id.clone();
        blocking(move || repo.list_for_user(&user_id)).await
    }

    async fn append_message(&self, id: &SessionId, message: &Message) -> Result<(), StorageError> {
        let repo = self.messages.clone();
        let id = id.clone();
        let message = message.clone();
        blocking(move || repo.append(&id, &message).map(|_| ())).await
    }

    async fn load_history(&self, id: &SessionId) -> Result<Vec<Message>, StorageError> {
        let repo = self.messages.clone();
        let id = id.clone();
        blocking(move || repo.list(&id)).await
    }

    async fn delete_session(&self, id: &SessionId) -> Result<bool, StorageError> {
        let repo = self.sessions.clone();
        let id = id.clone();
        blocking(move || repo.delete(&id)).await
    }

    async fn search_messages(
        &self,
        user_id: &UserId,
        term: &str,
        limit: usize,
    ) -> Result<Vec<MessageHit>, StorageError> {
        let repo = self.messages.clone();
        let user_id = user_id.clone();
        let term = term.to_owned();
        blocking(move || repo.search(&user_id, &term, limit)).await
    }

    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StorageError> {
        let repo = self.sessions.clone();
        blocking(move || repo.purge_updated_before(cutoff)).await
    }
}

#[derive(Clone)]
pub struct SqliteBlobStore {
    repo: BlobRepo,
}

impl SqliteBlobStore {
    pub fn new(db: Database) -> Self {
        Self {
            repo: BlobRepo::new(db),
        }
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<(), StorageError> {
        let repo = self.repo.clone();
        let key = key.to_owned();
        let content_type = content_type.to_owned();
        blocking(move || repo.put(&key, &content_type, &data)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Blob>, StorageError> {
        let repo = self.repo.clone();
        let key = key.to_owned();
        blocking(move || repo.get(&key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let repo = self.repo.clone();
        let prefix = prefix.to_owned();
        blocking(move || repo.list(&prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> (SqliteRecordStore, SqliteBlobStore) {
        let db = Database::in_memory().unwrap();
        (SqliteRecordStore::new(db.clone()), SqliteBlobStore::new(db))
    }

    #[tokio::test]
    async fn history_round_trips_through_trait() {
        let (records, _) = stores();
        let store: &dyn RecordStore = &records;
        let session = Session::new(SessionId::new(), UserId::from_raw("alice"), "gpt-test");
        store.create_session(&session).await.unwrap();

        let mut expected = Vec::new();
        for text in ["one", "two", "three"] {
            let before = store.load_history(&session.id).await.unwrap();
            assert_eq!(before, expected);
            let msg = Message::user(text);
            store.append_message(&session.id, &msg).await.unwrap();
            expected = store.load_history(&session.id).await.unwrap();
            assert_eq!(expected.len(), before.len() + 1);
            assert_eq!(expected.last().unwrap().content, text);
        }

        let listed = store.list_sessions(&UserId::from_raw("alice")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.delete_session(&session.id).await.unwrap());
        assert!(store.get_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn errors_map_to_storage_kinds() {
        let (records, _) = stores();
        let session = Session::new(SessionId::from_raw("dup"), UserId::from_raw("a"), "m");
        records.create_session(&session).await.unwrap();
        assert!(matches!(
            records.create_session(&session).await,
            Err(StorageError::Conflict(_))
        ));
        assert!(matches!(
            records.append_message(&SessionId::from_raw("missing"), &Message::user("x")).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn purge_inactive_returns_removed_ids() {
        let (records, _) = stores();
        let session = Session::new(SessionId::new(), UserId::from_raw("a"), "m");
        records.create_session(&session).await.unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(records.purge_inactive(past).await.unwrap().is_empty());

        let future = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(records.purge_inactive(future).await.unwrap(), vec![session.id.clone()]);
        assert!(records.get_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blobs_through_trait() {
        let (_, blobs) = stores();
        blobs.put("u/alice/img.png", "image/png", Bytes::from_static(b"\x89PNG")).await.unwrap();
        let blob = blobs.get("u/alice/img.png").await.unwrap().unwrap();
        assert_eq!(blob.content_type, "image/png");
        assert_eq!(blobs.list("u/alice/").await.unwrap(), vec!["u/alice/img.png"]);
    }
}
