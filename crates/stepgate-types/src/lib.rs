//! Shared domain types for stepgate.
//!
//! This crate contains the core domain types used across the engine:
//! workflow definitions, tasks, checkpoints, audit entries, events, and
//! engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod audit;
pub mod checkpoint;
pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod task;
