//! The central service: session and event persistence, blob storage and
//! the command bus, behind a framed TCP service loop.

pub mod backup_api;
pub mod blob_store;
pub mod command_bus;
pub mod event_api;
pub mod restore_api;
pub mod service;
pub mod store;

pub use service::{run, run_with_listener, ServerState};
