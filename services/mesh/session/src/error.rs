//! Session error kinds and the display-code table.

use mesh_wire::{PeerAddr, WireError};
use thiserror::Error;

/// Display code: a proposed nickname is empty
pub const CODE_INVALID_NICKNAME: u16 = 400;
/// Display code: a proposed nickname is already taken
pub const CODE_NICKNAME_UNAVAILABLE: u16 = 409;
/// Display code: the room could not be reached or refused the join
pub const CODE_ROOM_UNAVAILABLE: u16 = 503;

/// Map a display code to the text shown to the user
pub fn describe(code: u16) -> &'static str {
    match code {
        CODE_INVALID_NICKNAME => "nickname must not be empty",
        CODE_NICKNAME_UNAVAILABLE => "nickname is not available",
        CODE_ROOM_UNAVAILABLE => "room is not reachable",
        _ => "unknown error",
    }
}

/// Errors raised by sessions and peer connections
#[derive(Error, Debug)]
pub enum SessionError {
    /// Join refused (`conn: false`) or the room could not be reached
    #[error("room {addr} is not reachable: {reason}")]
    RoomUnavailable {
        /// Address that was dialled
        addr: PeerAddr,
        /// Why the join failed
        reason: String,
    },

    /// Remote closed the socket, or a read/write failed terminally
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Bytes received did not form a valid envelope
    #[error("malformed envelope: {0}")]
    Malformed(#[from] WireError),

    /// A nickname is already held by another member
    #[error("nickname `{0}` is already in use")]
    NameCollision(String),

    /// The bootstrap state machine was driven out of order
    #[error("invalid phase transition from {from} to {to}")]
    InvalidTransition {
        /// Current phase
        from: &'static str,
        /// Requested phase
        to: &'static str,
    },

    /// The session actor has stopped
    #[error("session has stopped")]
    Stopped,

    /// Socket-level failure outside a peer connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Display code for this error, when one exists
    pub fn code(&self) -> Option<u16> {
        match self {
            SessionError::RoomUnavailable { .. } => Some(CODE_ROOM_UNAVAILABLE),
            SessionError::NameCollision(_) => Some(CODE_NICKNAME_UNAVAILABLE),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_known_and_unknown_codes() {
        assert_eq!(describe(503), "room is not reachable");
        assert_eq!(describe(409), "nickname is not available");
        assert_eq!(describe(999), "unknown error");
    }

    #[test]
    fn test_room_unavailable_maps_to_503() {
        let err = SessionError::RoomUnavailable {
            addr: PeerAddr::new("localhost", 4400),
            reason: "join refused".to_string(),
        };
        assert_eq!(err.code(), Some(503));
        assert_eq!(SessionError::Stopped.code(), None);
    }
}
