//! dirsync core library.
//!
//! This crate provides the components for one-way synchronization of
//! directory users, groups and memberships into a local identity store:
//! configuration, the failover-aware directory client, per-endpoint sync
//! cursors, attribute mapping, the entity reconcilers, SQLite persistence,
//! blob storage and the sync engine.

pub mod blob;
pub mod config;
pub mod cursor;
pub mod db;
pub mod directory;
pub mod errors;
pub mod hooks;
pub mod mapper;
pub mod models;
pub mod plan;
pub mod reconcile;
pub mod store;
pub mod sync_engine;

// Re-exports for convenience.
pub use blob::{BlobStore, FsBlobStore};
pub use config::AppConfig;
pub use cursor::SyncCursor;
pub use db::Database;
pub use directory::LdapTransport;
pub use store::{CursorStore, IdentityStore};
pub use sync_engine::SyncEngine;
