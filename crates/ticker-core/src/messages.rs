//! Messages the server pushes to clients.
//!
//! `ServerMessage` is the logical message; the text form is produced by
//! `ticker-protocol`. `BroadcastMessage` is that text, frozen for one
//! broadcast tick and shared by every recipient.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveTime;

/// Logical server-to-client message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessage {
    /// One-time acknowledgment sent to a connection right after it
    /// becomes active.
    Welcome,

    /// Periodic wall-clock broadcast. Sub-second precision is not sent.
    Time(NaiveTime),
}

/// Immutable text payload for one broadcast tick.
///
/// Cloning is cheap; every recipient shares the same allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BroadcastMessage(Arc<str>);

impl BroadcastMessage {
    pub fn new(text: impl Into<Arc<str>>) -> Self {
        BroadcastMessage(text.into())
    }

    pub fn text(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BroadcastMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for BroadcastMessage {
    fn from(text: String) -> Self {
        BroadcastMessage::new(text)
    }
}
