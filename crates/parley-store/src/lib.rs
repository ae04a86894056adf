//! SQLite persistence for sessions, message history and blobs.

pub mod blobs;
pub mod database;
pub mod error;
pub mod messages;
pub mod record_store;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use blobs::BlobRepo;
pub use database::Database;
pub use error::StoreError;
pub use messages::MessageRepo;
pub use record_store::{SqliteBlobStore, SqliteRecordStore};
pub use sessions::SessionRepo;
