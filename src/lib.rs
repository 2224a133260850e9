//! edge-connector: a minimal edge-facing TCP transport.
//!
//! The `transport` module is the core: an owned socket handle, an
//! edge-triggered readiness multiplexer, a non-blocking read/write engine,
//! and the server (listener) and client (connector) roles built on them.
//!
//! `device` is a small demo collaborator that answers one JSON request per
//! connection, and `config` loads CLI and TOML settings for the binary.

pub mod config;
pub mod device;
pub mod transport;
