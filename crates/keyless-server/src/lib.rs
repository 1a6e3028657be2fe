//! Keyless Server -- listener supervision, TLS bring-up, and the
//! per-connection protocol engine.
//!
//! The binary in `main.rs` is a thin CLI wrapper around these modules;
//! the integration tests drive a real server in-process.

pub mod connection;
pub mod server;
pub mod tls;
