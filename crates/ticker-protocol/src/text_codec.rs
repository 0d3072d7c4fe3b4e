//! Text codec for server messages.
//!
//! Format:
//! - Welcome: `Connection established.`
//! - Time:    `The time is now HH:MM:SS` (24-hour, zero-padded)

use chrono::NaiveTime;
use thiserror::Error;

use ticker_core::ServerMessage;

/// Acknowledgment sent once to each new connection.
pub const WELCOME_TEXT: &str = "Connection established.";

/// Prefix of every periodic time message.
pub const TIME_PREFIX: &str = "The time is now ";

const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Text matches no known server message.
    #[error("unrecognised server message: {0:?}")]
    Unrecognised(String),

    /// Time message whose clock part is not `HH:MM:SS`.
    #[error("invalid time {0:?} in server message")]
    InvalidTime(String),
}

/// Encode a server message as a text frame.
pub fn encode(msg: &ServerMessage) -> String {
    match msg {
        ServerMessage::Welcome => WELCOME_TEXT.to_string(),
        ServerMessage::Time(time) => format!("{}{}", TIME_PREFIX, time.format(TIME_FORMAT)),
    }
}

/// Decode a text frame received from the server.
pub fn decode(text: &str) -> Result<ServerMessage, ProtocolError> {
    let text = text.trim_end();

    if text == WELCOME_TEXT {
        return Ok(ServerMessage::Welcome);
    }

    let clock = text
        .strip_prefix(TIME_PREFIX)
        .ok_or_else(|| ProtocolError::Unrecognised(text.to_string()))?;

    // chrono accepts single-digit fields; the wire format does not.
    if clock.len() != 8 {
        return Err(ProtocolError::InvalidTime(clock.to_string()));
    }

    NaiveTime::parse_from_str(clock, TIME_FORMAT)
        .map(ServerMessage::Time)
        .map_err(|_| ProtocolError::InvalidTime(clock.to_string()))
}
