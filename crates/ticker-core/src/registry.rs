//! Registry of active connections and per-tick delivery.
//!
//! Membership is exactly the set of connections in `ConnectionState::Active`.
//! The lock is only held to mutate the map or to clone `Arc` handles out of
//! it; no transport I/O ever happens under the lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::error::{DeliveryError, RegistrationError};
use crate::messages::BroadcastMessage;

/// Outcome of one delivery cycle. Not retained across cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Connections in the snapshot the cycle wrote to.
    pub recipients: usize,
    /// Writes that succeeded.
    pub delivered: usize,
    /// Connections this cycle removed after a failed write.
    pub removed: Vec<ConnectionId>,
}

/// Set of active connections, keyed and ordered by `ConnectionId`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<BTreeMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    /// Register an active connection.
    ///
    /// A duplicate identity or a connection that is not active leaves the
    /// registry unchanged.
    pub async fn add(&self, connection: Arc<Connection>) -> Result<(), RegistrationError> {
        let id = connection.id();
        let mut guard = self.connections.write().await;

        let state = connection.state();
        if state != ConnectionState::Active {
            return Err(RegistrationError::NotActive { id, state });
        }
        if guard.contains_key(&id) {
            return Err(RegistrationError::Duplicate(id));
        }

        guard.insert(id, connection);
        debug!(conn_id = %id, active = guard.len(), "connection registered");
        Ok(())
    }

    /// Remove a connection by identity.
    ///
    /// Absent ids are a no-op. When several callers race to remove the same
    /// connection, exactly one of them gets `Some`.
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut guard = self.connections.write().await;
        let removed = guard.remove(&id);
        if removed.is_some() {
            debug!(conn_id = %id, active = guard.len(), "connection deregistered");
        }
        removed
    }

    /// Point-in-time copy of the active connections, ordered by id.
    ///
    /// The returned handles are detached from the live map, so callers can
    /// iterate while other tasks keep adding and removing.
    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        let guard = self.connections.read().await;
        guard
            .values()
            .filter(|conn| conn.is_active())
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Write `message` to every connection in a fresh snapshot.
    ///
    /// Writes run concurrently. A connection whose write fails or takes
    /// longer than `write_timeout` is removed and moved to `ClosedError`;
    /// its endpoint observes the transition and tears down the transport.
    /// Failures never stop delivery to the remaining connections.
    pub async fn deliver(
        &self,
        message: &BroadcastMessage,
        write_timeout: Duration,
    ) -> DeliveryReport {
        let recipients = self.snapshot().await;
        if recipients.is_empty() {
            return DeliveryReport::default();
        }

        let text = message.text();
        let outcomes = join_all(recipients.iter().map(|conn| async move {
            let outcome = match timeout(write_timeout, conn.send(text)).await {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::Timeout(write_timeout)),
            };
            (conn, outcome)
        }))
        .await;

        let mut report = DeliveryReport {
            recipients: recipients.len(),
            ..DeliveryReport::default()
        };

        for (conn, outcome) in outcomes {
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    if self.remove(conn.id()).await.is_some() {
                        warn!(
                            conn_id = %conn.id(),
                            error = %err,
                            "delivery failed, connection removed"
                        );
                        report.removed.push(conn.id());
                    }
                    // The endpoint may have closed it first; either way it is terminal now.
                    let _ = conn.transition(ConnectionState::ClosedError);
                }
            }
        }

        report
    }
}
