//! SQLite-backed persistence of session snapshots.
//!
//! Sessions and tabs persist with their transient runtime fields stripped
//! (busy flags, thinking timers, error state, pids); queue contents are
//! kept so queued-but-unprocessed work survives a restart. Writes are
//! debounced: the engine sends a fresh record on every settled mutation
//! and the writer collapses bursts into one upsert per session.

pub mod database;
pub mod migrations;
pub mod record;
pub mod sessions;
pub mod writer;

pub use database::{Database, DatabaseError};
pub use record::{SessionRecord, TabRecord};
pub use sessions::SessionSnapshotStore;
pub use writer::spawn_writer;
