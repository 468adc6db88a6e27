use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Everything that can go wrong inside the engine.
///
/// Several of these are matched on by callers (a rejected password is terminal while a server
///  timeout triggers the reconnect policy), so this is a concrete enum rather than an opaque
///  error type. Variants are cheap to clone because a single teardown reason fans out to every
///  pending request of a connection.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum RconError {
    #[error("not connected")]
    NoConnection,

    #[error("a connection to this remote is already registered")]
    ConnectionExists,

    #[error("datagram from unknown remote {remote} (id {id:?})")]
    UnknownConnection { id: ConnectionId, remote: SocketAddr },

    #[error("server does not know the command {0:?}")]
    UnknownCommand(String),

    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),

    #[error("the server rejected the password")]
    InvalidPassword,

    #[error("packet is not sendable")]
    InvalidPacket,

    #[error("invalid sequence number {0}")]
    InvalidSequence(u8),

    #[error("malformed packet: {0}")]
    PacketError(&'static str),

    #[error("sequence number already has a request in flight")]
    PacketOverflow,

    #[error("server stopped responding")]
    ServerTimeout,

    #[error("connection closed")]
    ServerDisconnect,

    #[error("gave up on multipart reply after too many retransmissions")]
    MaxRetries,

    #[error("cannot log in without a password")]
    NoPassword,

    #[error("command packet without a command")]
    NoCommand,

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RconError {
    fn from(e: std::io::Error) -> Self {
        RconError::Io(e.to_string())
    }
}
