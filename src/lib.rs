//! Library crate for ssrf-relay exposing reusable modules.
pub mod event_log;
pub mod fetch;
pub mod scanner;
pub mod server;
pub mod types;
