//! WebSocket write half as a `MessageSink`.

use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;

use ticker_core::{DeliveryError, MessageSink};

use crate::types::WsWriter;

/// Write half of one client's WebSocket.
///
/// The mutex keeps the welcome message, broadcast frames and the final
/// close frame from interleaving.
pub(crate) struct WsSink {
    writer: Mutex<WsWriter>,
    close_timeout: Duration,
}

impl WsSink {
    /// `close_timeout` bounds the close handshake; a peer that stopped
    /// reading cannot hold the connection open past it.
    pub(crate) fn new(writer: WsWriter, close_timeout: Duration) -> Self {
        WsSink {
            writer: Mutex::new(writer),
            close_timeout,
        }
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&self, text: &str) -> Result<(), DeliveryError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::text(text.to_owned()))
            .await
            .map_err(|err| match err {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    DeliveryError::Closed
                }
                other => DeliveryError::Transport(other.to_string()),
            })
    }

    async fn close(&self) {
        let closing = async {
            let mut writer = self.writer.lock().await;
            writer.close().await
        };
        // On timeout the writer is simply dropped with the connection.
        if timeout(self.close_timeout, closing).await.is_err() {
            debug!(timeout = ?self.close_timeout, "close handshake abandoned");
        }
    }
}
