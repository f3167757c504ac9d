//! HTTP handlers, one module per resource (spec §6.1).

pub mod admin;
pub mod artifacts;
pub mod jobs;
pub mod query_definitions;
