//! Realtime websocket modules.
//!
//! - `client`: socket driver, update feed and interactive terminals.
//! - `handshake`: login state machine run on every new socket.
//! - `proto`: wire types shared with Komodo Core.
//! - `supervisor`: reconnect loop and cooperative cancellation.

/// Websocket connections and terminal input sender.
pub mod client;
/// Login handshake state machine.
pub mod handshake;
/// Wire messages.
pub mod proto;
/// Reconnect and cancel handling.
pub mod supervisor;
