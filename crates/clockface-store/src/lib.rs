//! clockface-store: Durable backends for the attendance engine.
//!
//! SQLite holds the employee roster, templates and sessions; enrollment and
//! attendance photos live on the filesystem under the upload directory.

pub mod blob;
pub mod migrations;
pub mod sqlite;

pub use blob::FsBlobStore;
pub use sqlite::SqliteStore;
