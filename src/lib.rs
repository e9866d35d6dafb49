//! Rust client for the Komodo Core API.
//!
//! The crate is organized by transport surface:
//! - `rpc`: JSON RPC client for the `auth`, `user`, `read`, `write` and
//!   `execute` namespaces.
//! - `poll`: execute a task and wait for its update to complete.
//! - `terminal`: streamed command execution over chunked HTTP.
//! - `stream`: authenticated websocket connections with reconnects.
//! - `auth`: credentials and the session that carries them.
//! - `retry`: shared retry and timeout utilities.

/// Credentials and session state.
pub mod auth;
/// Execute and poll helpers.
pub mod poll;
/// Retry and timeout helpers used across the crate.
pub mod retry;
/// RPC client and error types.
pub mod rpc;
/// Websocket connections, login handshake and reconnect supervisor.
pub mod stream;
/// Streamed terminal and container exec.
pub mod terminal;

pub use auth::{Credentials, Session};
pub use rpc::{KomodoClient, KomodoClientOptions, Namespace, RpcError};
