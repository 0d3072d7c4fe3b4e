//! ticker-server
//!
//! WebSocket server that pushes the current time to every connected client.

pub mod broadcaster;
pub mod config;
pub mod endpoint;
pub mod server;
pub mod types;

// internal, the rest of the crate only sees `MessageSink`
mod transport;
