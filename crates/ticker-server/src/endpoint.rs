//! Per-connection lifecycle.
//!
//! `ConnectionEndpoint` turns transport events into lifecycle transitions
//! and keeps registry membership in step with them:
//!
//! - handshake ok         -> `Active`, registered, welcome sent to this client only
//! - close frame / EOF    -> `Closed`, deregistered
//! - transport error      -> `ClosedError`, deregistered
//! - failed welcome write -> `ClosedError`, same path
//! - failed broadcast     -> the registry already moved it to `ClosedError`;
//!                           the endpoint notices and releases the transport
//!
//! `activate`, `handle`, `close` and `fail` only need a `Connection`, so the
//! state machine runs without sockets. `serve` drives it from a WebSocket.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ticker_core::{Connection, ConnectionId, ConnectionState, ServerMessage};
use ticker_protocol::text_codec;

use crate::transport::WsSink;
use crate::types::{HandshakeError, SharedRegistry, WsReader, WsWriter};

/// Something the transport reported for an active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Inbound text frame. Clients are not expected to send anything.
    Text(String),
    /// Inbound binary frame, by length.
    Binary(usize),
    /// Ping/pong and other control traffic.
    Control,
    /// Clean disconnect: close frame, EOF, or server shutdown.
    Closed,
    /// Transport failure.
    Error(String),
}

impl TransportEvent {
    fn from_frame(frame: Option<Result<Message, tungstenite::Error>>) -> Self {
        match frame {
            None | Some(Ok(Message::Close(_))) => TransportEvent::Closed,
            Some(Ok(Message::Text(text))) => TransportEvent::Text(text.to_string()),
            Some(Ok(Message::Binary(data))) => TransportEvent::Binary(data.len()),
            Some(Ok(_)) => TransportEvent::Control,
            Some(Err(tungstenite::Error::ConnectionClosed)) => TransportEvent::Closed,
            Some(Err(err)) => TransportEvent::Error(err.to_string()),
        }
    }
}

/// Bridges one connection's transport to the shared registry.
#[derive(Debug, Clone)]
pub struct ConnectionEndpoint {
    registry: SharedRegistry,
    handshake_timeout: Duration,
    write_timeout: Duration,
}

impl ConnectionEndpoint {
    pub fn new(
        registry: SharedRegistry,
        handshake_timeout: Duration,
        write_timeout: Duration,
    ) -> Self {
        ConnectionEndpoint {
            registry,
            handshake_timeout,
            write_timeout,
        }
    }

    /// Upgrade `stream`, then drive the connection until it is terminal.
    ///
    /// Returns the terminal state, or why the client never became active.
    pub async fn serve(
        &self,
        id: ConnectionId,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> Result<ConnectionState, HandshakeError> {
        let handshake = tokio_tungstenite::accept_async(stream);
        let ws = match timeout(self.handshake_timeout, handshake).await {
            Ok(Ok(ws)) => ws,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(HandshakeError::Timeout(self.handshake_timeout)),
        };

        let (writer, mut reader): (WsWriter, WsReader) = ws.split();
        let sink = WsSink::new(writer, self.write_timeout);
        let conn = Arc::new(Connection::new(id, Arc::new(sink)));

        let mut state = self.activate(&conn).await;
        while !state.is_terminal() {
            let event = tokio::select! {
                _ = shutdown.cancelled() => TransportEvent::Closed,
                _ = conn.terminated() => {
                    TransportEvent::Error("broadcast delivery failed".to_string())
                }
                frame = reader.next() => TransportEvent::from_frame(frame),
            };
            state = self.handle(&conn, event).await;
        }

        Ok(state)
    }

    /// `Connecting -> Active`: register, then greet this connection alone.
    ///
    /// Broadcasts to this connection wait until the welcome is written.
    pub async fn activate(&self, conn: &Arc<Connection>) -> ConnectionState {
        if let Err(err) = conn.transition(ConnectionState::Active) {
            warn!(conn_id = %conn.id(), error = %err, "cannot activate connection");
            return conn.state();
        }

        let welcome = text_codec::encode(&ServerMessage::Welcome);
        let welcomed = {
            let writes = conn.lock_writes().await;
            if let Err(err) = self.registry.add(Arc::clone(conn)).await {
                // Someone else owns this id in the registry; leave their entry alone.
                warn!(conn_id = %conn.id(), error = %err, "registration rejected");
                let _ = conn.transition(ConnectionState::ClosedError);
                drop(writes);
                conn.close_transport().await;
                return conn.state();
            }
            info!(conn_id = %conn.id(), "connection active");

            writes.send(&welcome).await
        };

        if let Err(err) = welcomed {
            return self.fail(conn, &format!("welcome not delivered: {}", err)).await;
        }

        conn.state()
    }

    /// Apply one transport event and return the resulting state.
    pub async fn handle(&self, conn: &Arc<Connection>, event: TransportEvent) -> ConnectionState {
        match event {
            TransportEvent::Text(text) => {
                debug!(conn_id = %conn.id(), %text, "ignoring inbound text");
                conn.state()
            }
            TransportEvent::Binary(len) => {
                debug!(conn_id = %conn.id(), len, "ignoring inbound binary");
                conn.state()
            }
            TransportEvent::Control => conn.state(),
            TransportEvent::Closed => self.close(conn).await,
            TransportEvent::Error(reason) => self.fail(conn, &reason).await,
        }
    }

    /// `Active -> Closed`.
    pub async fn close(&self, conn: &Arc<Connection>) -> ConnectionState {
        if conn.transition(ConnectionState::Closed).is_ok() {
            info!(conn_id = %conn.id(), "connection closed");
        }
        self.release(conn).await
    }

    /// `Active -> ClosedError`.
    pub async fn fail(&self, conn: &Arc<Connection>, reason: &str) -> ConnectionState {
        match conn.transition(ConnectionState::ClosedError) {
            Ok(_) => warn!(conn_id = %conn.id(), reason, "connection failed"),
            Err(_) => debug!(
                conn_id = %conn.id(),
                state = %conn.state(),
                reason,
                "connection already terminal"
            ),
        }
        self.release(conn).await
    }

    async fn release(&self, conn: &Arc<Connection>) -> ConnectionState {
        // Removal may race the broadcaster's; the registry makes that a no-op.
        let _ = self.registry.remove(conn.id()).await;
        conn.close_transport().await;
        conn.state()
    }
}
