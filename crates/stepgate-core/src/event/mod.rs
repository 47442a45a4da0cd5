//! Event bus for workflow lifecycle notifications.
//!
//! Provides the `EventSink` capability the executor emits through, and an
//! `EventBus` that distributes `WorkflowEvent` messages to all subscribers via
//! a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::{EventBus, EventSink};
