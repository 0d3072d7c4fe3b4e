//! TCP listener and top-level server wiring.
//!
//! This module:
//! - Listens on the configured address/port.
//! - Accepts new TCP connections and assigns each a `ConnectionId`.
//! - Spawns:
//!   - one task per connection running a `ConnectionEndpoint`,
//!   - a single `Broadcaster` task ticking on the configured period.
//!
//! Every accepted socket holds one of `max_clients` slots from before its
//! handshake until its endpoint task ends.
//!
//! Shutdown order: stop accepting, stop the broadcaster and wait for it,
//! then close every connection and wait for the endpoint tasks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use ticker_core::{ConnectionIds, ConnectionRegistry};

use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::endpoint::ConnectionEndpoint;
use crate::types::{HandshakeError, SharedRegistry};

/// A bound, not yet running, ticker server.
#[derive(Debug)]
pub struct Server {
    config: Config,
    listener: TcpListener,
    registry: SharedRegistry,
    broadcaster: Arc<Broadcaster>,
    endpoint: ConnectionEndpoint,
    ids: ConnectionIds,
    slots: Arc<Semaphore>,
}

impl Server {
    /// Bind the listener and wire the components around a fresh registry.
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        ensure!(
            config.max_clients <= Semaphore::MAX_PERMITS,
            "max_clients must be at most {}",
            Semaphore::MAX_PERMITS
        );

        let addr = config.socket_addr_string();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        let registry: SharedRegistry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(
            registry.clone(),
            config.broadcast_interval,
            config.write_timeout,
        ));
        let endpoint = ConnectionEndpoint::new(
            registry.clone(),
            config.handshake_timeout,
            config.write_timeout,
        );
        let slots = Arc::new(Semaphore::new(config.max_clients));

        Ok(Server {
            config,
            listener,
            registry,
            broadcaster,
            endpoint,
            ids: ConnectionIds::new(),
            slots,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "listening");

        let broadcast_task = self.broadcaster.spawn(shutdown.clone());

        // Separate token so connections outlive the broadcaster during shutdown.
        let connections = CancellationToken::new();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer, &connections, &mut tasks),
                    Err(err) => warn!(error = %err, "accept failed"),
                },
            }
        }

        info!("shutting down");
        if let Err(err) = broadcast_task.await {
            warn!(error = %err, "broadcaster task ended abnormally");
        }

        connections.cancel();
        while tasks.join_next().await.is_some() {}
        let remaining = self.registry.len().await;
        info!(remaining, "server stopped");

        Ok(())
    }

    fn accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        connections: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) {
        let Ok(slot) = self.slots.clone().try_acquire_owned() else {
            let err = HandshakeError::AtCapacity(self.config.max_clients);
            warn!(%peer, error = %err, "rejecting connection");
            // Dropping the stream closes it before any handshake.
            return;
        };

        let id = self.ids.next_id();
        let endpoint = self.endpoint.clone();
        let shutdown = connections.clone();
        let span = info_span!("connection", conn_id = %id, %peer);

        tasks.spawn(
            async move {
                match endpoint.serve(id, stream, shutdown).await {
                    Ok(state) => info!(%state, "connection finished"),
                    Err(err) => warn!(error = %err, "handshake failed"),
                }
                drop(slot);
            }
            .instrument(span),
        );
    }
}

/// Bind with `config` and serve until ctrl-c.
pub async fn run(config: Config) -> Result<()> {
    let server = Server::bind(config).await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("ctrl-c received"),
                Err(err) => warn!(error = %err, "cannot listen for ctrl-c, shutting down"),
            }
            shutdown.cancel();
        });
    }

    server.run(shutdown).await
}
