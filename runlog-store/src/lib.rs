//! Durable-write backends for the runlog pipeline.
//!
//! - [`MemoryBackend`]: thread-safe in-memory store that records every call.
//! - [`SqliteBackend`]: SQLite store with foreign keys enforced (feature `storage`).

#![forbid(unsafe_code)]

pub mod memory;
#[cfg(feature = "storage")]
pub mod sqlite;

pub use memory::{BackendCall, BackendOp, MemoryBackend, MemorySummary};
#[cfg(feature = "storage")]
pub use sqlite::SqliteBackend;
