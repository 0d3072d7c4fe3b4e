//! Shared types for the ticker server.
//!
//! This module defines:
//! - the WebSocket stream aliases used by the transport and endpoint
//! - `SharedRegistry`, the handle every component is wired with
//! - `HandshakeError`: why a client never became active

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use ticker_core::ConnectionRegistry;

/// Server side of an upgraded connection.
pub type WsStream = WebSocketStream<TcpStream>;
pub type WsWriter = SplitSink<WsStream, Message>;
pub type WsReader = SplitStream<WsStream>;

/// Registry of active connections, shared by the accept loop, the
/// endpoints and the broadcaster for the lifetime of the server.
pub type SharedRegistry = Arc<ConnectionRegistry>;

/// A client attempt that never reached the active state.
///
/// Only ever affects that one client; nothing was registered.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("server at capacity ({0} clients)")]
    AtCapacity(usize),

    #[error("websocket handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("websocket handshake failed: {0}")]
    Protocol(#[from] tungstenite::Error),
}
