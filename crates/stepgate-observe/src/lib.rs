//! Observability for stepgate: subscriber setup and optional trace export.

pub mod tracing_setup;
