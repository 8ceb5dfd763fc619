//! Broker service library crate.
//!
//! # Purpose
//! Exposes the service subsystems (config, observability, the WebSocket
//! accept loop) for use by the `socketbox-server` binary and integration
//! tests.
pub mod config;
pub mod observability;
pub mod server;
