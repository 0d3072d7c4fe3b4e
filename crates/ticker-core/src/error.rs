//! Error types for the ticker core.
//!
//! None of these are fatal to the server. Each one is scoped to a single
//! connection: the caller logs it and moves on.

use std::time::Duration;

use thiserror::Error;

use crate::connection::{ConnectionId, ConnectionState};

/// Rejected `ConnectionRegistry::add`. The registry is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// A connection with the same identity is already registered.
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),

    /// Only active connections may be registered.
    #[error("connection {id} is {state}, only active connections can be registered")]
    NotActive {
        id: ConnectionId,
        state: ConnectionState,
    },
}

/// A write to one connection failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The transport was already closed.
    #[error("transport closed")]
    Closed,

    /// The transport reported an error while writing.
    #[error("transport write failed: {0}")]
    Transport(String),

    /// The write did not complete in time.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

/// A lifecycle transition that the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
}
