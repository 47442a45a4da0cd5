//! Infrastructure layer for stepgate.
//!
//! Contains implementations of the repository traits defined in `stepgate-core`:
//! SQLite storage for tasks, checkpoints and the audit log, plus the
//! filesystem-backed configuration loader.

pub mod config;
pub mod sqlite;
