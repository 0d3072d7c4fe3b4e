//! ticker-core
//!
//! Transport-independent pieces of the ticker server:
//! - connection identity and lifecycle state
//! - the registry of active connections and per-tick delivery
//! - server message types
//! - error types

pub mod connection;
pub mod error;
pub mod messages;
pub mod registry;

pub use connection::{
    Connection, ConnectionId, ConnectionIds, ConnectionState, MessageSink, WriteGuard,
};
pub use error::{DeliveryError, LifecycleError, RegistrationError};
pub use messages::{BroadcastMessage, ServerMessage};
pub use registry::{ConnectionRegistry, DeliveryReport};
