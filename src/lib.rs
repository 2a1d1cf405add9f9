//! Endpoint backup agent with identity-preserving file tracking and a
//! paired central service.
//!
//! The endpoint side observes watched directories, assigns every file a
//! stable identity that survives rename and move, journals events locally
//! and forwards them to the server, and streams incremental backups as
//! resumable chunked transfers. The server side persists sessions, event
//! histories and a reconstructable directory tree per device, and pushes
//! administrative commands back to connected endpoints.

pub mod client;
pub mod config;
pub mod error;
pub mod monitor;
pub mod protocol;
pub mod server;
pub mod store;
pub mod tools;
