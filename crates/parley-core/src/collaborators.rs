//! Narrow interfaces to the services the orchestrator depends on but does
//! not own: identity, durable records, and blobs.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{AuthError, StorageError};
use crate::ids::{SessionId, UserId};
use crate::messages::{Message, Session};

/// Resolves a bearer credential to a stable user identity.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// A message found by [`RecordStore::search_messages`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageHit {
    pub session_id: SessionId,
    pub message: Message,
}

/// Durable session and message rows. Only single-row atomicity is assumed.
///
/// `load_history` after `append_message(s, m)` must equal the previous
/// history with `m` appended.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_session(&self, session: &Session) -> Result<(), StorageError>;
    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StorageError>;
    async fn list_sessions(&self, user_id: &UserId) -> Result<Vec<Session>, StorageError>;
    async fn append_message(&self, id: &SessionId, message: &Message) -> Result<(), StorageError>;
    async fn load_history(&self, id: &SessionId) -> Result<Vec<Message>, StorageError>;
    /// Returns whether a session was removed.
    async fn delete_session(&self, id: &SessionId) -> Result<bool, StorageError>;
    async fn search_messages(
        &self,
        user_id: &UserId,
        term: &str,
        limit: usize,
    ) -> Result<Vec<MessageHit>, StorageError>;
    /// Delete sessions last updated before `cutoff`, returning their ids.
    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>, StorageError>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct Blob {
    pub content_type: String,
    pub data: Bytes,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, content_type: &str, data: Bytes) -> Result<(), StorageError>;
    async fn get(&self, key: &str) -> Result<Option<Blob>, StorageError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}
