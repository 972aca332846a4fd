//! Infrastructure layer for persistence and logging
//!
//! Provides the SQLite connection/migration plumbing, the durable checkpoint
//! store every worker reports into, and tracing initialization.

pub mod checkpoint_store;
pub mod database_connection;
pub mod logging;

// Re-export commonly used items
pub use checkpoint_store::{CheckpointStore, SessionStats, StoreError};
pub use database_connection::DatabaseConnection;
