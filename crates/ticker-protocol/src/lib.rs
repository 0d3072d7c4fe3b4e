//! ticker-protocol
//!
//! Wire-level text encoding for the ticker server.
//!
//! Every server message travels as one plain-text WebSocket frame; there
//! is no JSON or binary framing on top.
//!
//! - [`text_codec`] : `ServerMessage` <-> text frame

pub mod text_codec;

pub use text_codec::{decode, encode, ProtocolError, TIME_PREFIX, WELCOME_TEXT};
