//! Workflow engine core: definitions, supervision, checkpoints, and execution.
//!
//! - `definition` -- YAML template parsing, validation, and the caching store
//! - `handler` -- step handler capability and registry
//! - `lock` -- per-project exclusivity
//! - `retry` -- exponential backoff with jitter
//! - `audit` -- append-only compliance log
//! - `checkpoint` -- pause decisions and checkpoint lifecycle
//! - `executor` -- step loop, task state machine, and entry points

pub mod audit;
pub mod checkpoint;
pub mod definition;
pub mod executor;
pub mod handler;
pub mod lock;
pub mod retry;

#[cfg(test)]
mod scenario_tests;
