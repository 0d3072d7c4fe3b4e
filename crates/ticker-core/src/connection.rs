//! A single client connection: identity, lifecycle state and the
//! capability to write text to the remote side.
//!
//! Lifecycle:
//!
//! ```text
//! Connecting --> Active --> Closed
//!                      \--> ClosedError
//! ```
//!
//! `Closed` and `ClosedError` are terminal. A connection that reached
//! either is never registered again; a reconnecting client gets a new
//! `Connection` with a new `ConnectionId`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, MutexGuard};

use crate::error::{DeliveryError, LifecycleError};

/// Identifier for a connection.
///
/// Opaque; unique over the lifetime of the `ConnectionIds` that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues `ConnectionId`s. Owned by whoever accepts connections.
#[derive(Debug)]
pub struct ConnectionIds {
    next: AtomicU64,
}

impl ConnectionIds {
    pub fn new() -> Self {
        ConnectionIds {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Handshake done, not yet registered.
    Connecting,
    /// Registered and eligible for broadcasts.
    Active,
    /// Clean disconnect or server shutdown.
    Closed,
    /// Transport failure, including a failed write.
    ClosedError,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::ClosedError)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Connecting, ConnectionState::Active)
                | (ConnectionState::Active, ConnectionState::Closed)
                | (ConnectionState::Active, ConnectionState::ClosedError)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Active => "active",
            ConnectionState::Closed => "closed",
            ConnectionState::ClosedError => "closed_error",
        };
        f.write_str(s)
    }
}

/// Write side of a transport.
///
/// Implementations must serialize their own writes: two callers sending
/// at once must not interleave frames.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Write one text message.
    async fn send_text(&self, text: &str) -> Result<(), DeliveryError>;

    /// Close the transport. Errors are swallowed; the peer may already be gone.
    async fn close(&self);
}

/// One live duplex channel to a client.
///
/// The registry and the broadcaster hold this through an `Arc`; the
/// endpoint that created it is the one that closes the transport.
pub struct Connection {
    id: ConnectionId,
    state: watch::Sender<ConnectionState>,
    sink: Arc<dyn MessageSink>,
    writes: Mutex<()>,
}

/// Exclusive right to write to one connection; see `Connection::lock_writes`.
pub struct WriteGuard<'a> {
    conn: &'a Connection,
    _lock: MutexGuard<'a, ()>,
}

impl WriteGuard<'_> {
    /// Write one text message while holding the lock.
    pub async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        self.conn.write(text).await
    }
}

impl Connection {
    /// New connection in the `Connecting` state.
    pub fn new(id: ConnectionId, sink: Arc<dyn MessageSink>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Connection {
            id,
            state,
            sink,
            writes: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Atomically move to `next`, returning the previous state.
    ///
    /// Racing terminal transitions resolve to exactly one winner; the
    /// loser gets `LifecycleError::InvalidTransition`.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState, LifecycleError> {
        let mut outcome = Ok(ConnectionState::Connecting);
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                outcome = Ok(*current);
                *current = next;
                true
            } else {
                outcome = Err(LifecycleError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        outcome
    }

    /// Resolves once the connection reaches a terminal state.
    pub async fn terminated(&self) -> ConnectionState {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.state()
    }

    /// Write one text message to the client.
    ///
    /// Waits while someone else holds `lock_writes`.
    pub async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        let writes = self.lock_writes().await;
        writes.send(text).await
    }

    /// Hold off every other `send` until the guard is dropped.
    ///
    /// Activation registers the connection and writes the welcome under
    /// this lock, so no broadcast can reach the client first.
    pub async fn lock_writes(&self) -> WriteGuard<'_> {
        WriteGuard {
            conn: self,
            _lock: self.writes.lock().await,
        }
    }

    async fn write(&self, text: &str) -> Result<(), DeliveryError> {
        if self.state().is_terminal() {
            return Err(DeliveryError::Closed);
        }
        self.sink.send_text(text).await
    }

    /// Close the underlying transport.
    pub async fn close_transport(&self) {
        self.sink.close().await;
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    /// In-memory sink that records writes and can be switched to fail.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) sent: Mutex<Vec<String>>,
        pub(crate) fail: AtomicBool,
    }

    impl RecordingSink {
        pub(crate) fn failing() -> Self {
            let sink = RecordingSink::default();
            sink.fail.store(true, Ordering::SeqCst);
            sink
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_text(&self, text: &str) -> Result<(), DeliveryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DeliveryError::Transport("broken pipe".into()));
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn close(&self) {}
    }

    pub(crate) fn active_connection(id: u64) -> (Arc<Connection>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let conn = Connection::new(ConnectionId(id), sink.clone());
        conn.transition(ConnectionState::Active).unwrap();
        (Arc::new(conn), sink)
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let ids = ConnectionIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert!(b > a);
        assert_ne!(a, b);
    }

    #[test]
    fn lifecycle_happy_path() {
        let conn = Connection::new(ConnectionId(1), Arc::new(RecordingSink::default()));
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(
            conn.transition(ConnectionState::Active),
            Ok(ConnectionState::Connecting)
        );
        assert!(conn.is_active());
        assert_eq!(
            conn.transition(ConnectionState::Closed),
            Ok(ConnectionState::Active)
        );
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn terminal_states_are_final() {
        let (conn, _sink) = active_connection(1);
        conn.transition(ConnectionState::ClosedError).unwrap();

        for next in [
            ConnectionState::Connecting,
            ConnectionState::Active,
            ConnectionState::Closed,
            ConnectionState::ClosedError,
        ] {
            assert_eq!(
                conn.transition(next),
                Err(LifecycleError::InvalidTransition {
                    from: ConnectionState::ClosedError,
                    to: next,
                })
            );
        }
        assert_eq!(conn.state(), ConnectionState::ClosedError);
    }

    #[test]
    fn cannot_skip_activation() {
        let conn = Connection::new(ConnectionId(1), Arc::new(RecordingSink::default()));
        assert!(conn.transition(ConnectionState::Closed).is_err());
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (conn, sink) = active_connection(1);
        conn.send("hello").await.unwrap();
        conn.transition(ConnectionState::Closed).unwrap();

        assert_eq!(conn.send("late").await, Err(DeliveryError::Closed));
        assert_eq!(sink.sent(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn terminated_resolves_on_terminal_transition() {
        let (conn, _sink) = active_connection(7);
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.terminated().await })
        };
        tokio::task::yield_now().await;
        conn.transition(ConnectionState::ClosedError).unwrap();

        assert_eq!(waiter.await.unwrap(), ConnectionState::ClosedError);
    }

    #[tokio::test]
    async fn terminated_returns_immediately_when_already_closed() {
        let (conn, _sink) = active_connection(7);
        conn.transition(ConnectionState::Closed).unwrap();
        assert_eq!(conn.terminated().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn send_waits_for_write_lock() {
        let (conn, sink) = active_connection(3);
        let writes = conn.lock_writes().await;

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send("second").await })
        };
        tokio::task::yield_now().await;
        writes.send("first").await.unwrap();
        assert_eq!(sink.sent(), vec!["first".to_string()]);

        drop(writes);
        pending.await.unwrap().unwrap();
        assert_eq!(sink.sent(), vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::ClosedError.to_string(), "closed_error");
        assert_eq!(ConnectionId(42).to_string(), "42");
    }
}
