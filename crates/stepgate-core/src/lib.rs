//! Workflow engine logic and repository trait definitions for stepgate.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus the engine itself: definition store, checkpoint
//! manager, audit logger, and the executor. It depends only on
//! `stepgate-types` -- never on `stepgate-infra` or any database/IO crate.

pub mod error;
pub mod event;
pub mod repository;
pub mod workflow;

pub use error::{EngineError, ErrorKind};
