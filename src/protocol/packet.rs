use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::RconError;
use crate::protocol::crc::payload_checksum;

/// `'B' 'E'` plus the four checksum bytes.
pub const FRAME_HEADER_LEN: usize = 6;

/// Every payload starts with this sentinel byte.
pub const PAYLOAD_SENTINEL: u8 = 0xff;

/// Shortest decodable packet: frame header, sentinel, type byte and one byte of body.
pub const MIN_PACKET_LEN: usize = 9;

/// A command reply whose byte after the sequence number is this marker is one fragment of a
///  multipart reply.
pub const MULTIPART_MARKER: u8 = 0x00;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Login = 0x00,
    Command = 0x01,
    Message = 0x02,
}

/// The wire bytes do not say which side sent a packet, but the type byte means different things
///  in each direction (an inbound `0x02` is a chat message, an outbound `0x02` acknowledges
///  one). Decoding therefore takes the direction as a parameter; the engine's receive path
///  always decodes [PacketDirection::Reply].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PacketDirection {
    Request,
    Reply,
    Split,
}

/// One variant per shape a packet can take on the wire.
///
/// Requests and the message ack are sendable; everything else only ever arrives from the
///  server. [Packet::serialize] refuses the non-sendable variants.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet {
    LoginRequest { password: String },
    LoginReply { success: bool },
    CommandRequest { sequence: u8, command: String },
    CommandReply { sequence: u8, data: String },
    CommandFragment { sequence: u8, total: u8, index: u8, part: Bytes },
    MessageIndication { sequence: u8, message: String },
    MessageAck { sequence: u8 },
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::LoginRequest { .. } | Packet::LoginReply { .. } => PacketType::Login,
            Packet::CommandRequest { .. } | Packet::CommandReply { .. } | Packet::CommandFragment { .. } => {
                PacketType::Command
            }
            Packet::MessageIndication { .. } | Packet::MessageAck { .. } => PacketType::Message,
        }
    }

    pub fn direction(&self) -> PacketDirection {
        match self {
            Packet::LoginRequest { .. } | Packet::CommandRequest { .. } => PacketDirection::Request,
            Packet::CommandFragment { .. } => PacketDirection::Split,
            Packet::LoginReply { .. } | Packet::CommandReply { .. } | Packet::MessageIndication { .. } => {
                PacketDirection::Reply
            }
            // the ack is the one packet a client sends with a reply-side type meaning
            Packet::MessageAck { .. } => PacketDirection::Reply,
        }
    }

    /// The sequence number binding a command to its reply. Login packets have none.
    pub fn sequence(&self) -> Option<u8> {
        match self {
            Packet::LoginRequest { .. } | Packet::LoginReply { .. } => None,
            Packet::CommandRequest { sequence, .. }
            | Packet::CommandReply { sequence, .. }
            | Packet::CommandFragment { sequence, .. }
            | Packet::MessageIndication { sequence, .. }
            | Packet::MessageAck { sequence } => Some(*sequence),
        }
    }

    /// The command text, for variants that carry one.
    pub fn command_text(&self) -> Option<&str> {
        match self {
            Packet::CommandRequest { command, .. } => Some(command),
            _ => None,
        }
    }

    /// Frames the packet for transmission: `'B' 'E'`, the payload's CRC-32 as little-endian
    ///  bytes, then the payload itself starting with the `0xFF` sentinel.
    ///
    /// Only login requests, command requests and message acks are sendable; anything else is
    ///  [RconError::InvalidPacket]. A login request without a password is refused with
    ///  [RconError::NoPassword].
    pub fn serialize(&self) -> Result<Bytes, RconError> {
        let mut payload = BytesMut::with_capacity(32);
        payload.put_u8(PAYLOAD_SENTINEL);
        match self {
            Packet::LoginRequest { password } => {
                if password.is_empty() {
                    return Err(RconError::NoPassword);
                }
                payload.put_u8(PacketType::Login.into());
                payload.put_slice(password.as_bytes());
            }
            Packet::CommandRequest { sequence, command } => {
                payload.put_u8(PacketType::Command.into());
                payload.put_u8(*sequence);
                payload.put_slice(command.as_bytes());
            }
            Packet::MessageAck { sequence } => {
                payload.put_u8(PacketType::Message.into());
                payload.put_u8(*sequence);
            }
            _ => {
                return Err(RconError::InvalidPacket);
            }
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        buf.put_slice(b"BE");
        buf.put_u32_le(payload_checksum(&payload));
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// Parses a framed packet. `direction` selects the interpretation of the type byte:
    ///  [PacketDirection::Reply] for traffic arriving from the server (the engine's case),
    ///  [PacketDirection::Request] for client-side packets.
    pub fn from_buffer(buf: &[u8], direction: PacketDirection) -> Result<Packet, RconError> {
        if buf.len() < MIN_PACKET_LEN {
            return Err(RconError::PacketError("packet too short"));
        }
        if &buf[..2] != b"BE" {
            return Err(RconError::PacketError("Invalid header text"));
        }

        let payload = &buf[FRAME_HEADER_LEN..];
        let wire_checksum = u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]);
        if wire_checksum != payload_checksum(payload) {
            return Err(RconError::PacketError("checksum verification failed"));
        }
        if payload[0] != PAYLOAD_SENTINEL {
            return Err(RconError::PacketError("missing 0xFF flag"));
        }

        let packet_type =
            PacketType::try_from(payload[1]).map_err(|_| RconError::UnknownPacketType(payload[1]))?;

        // MIN_PACKET_LEN guarantees at least one body byte
        let body = &payload[2..];

        let packet = match (packet_type, direction) {
            (PacketType::Login, PacketDirection::Request) => Packet::LoginRequest {
                password: String::from_utf8_lossy(body).into_owned(),
            },
            (PacketType::Login, _) => Packet::LoginReply { success: body[0] == 1 },
            (PacketType::Command, PacketDirection::Request) => Packet::CommandRequest {
                sequence: body[0],
                command: String::from_utf8_lossy(&body[1..]).into_owned(),
            },
            (PacketType::Command, _) => {
                if body.len() > 2 && body[1] == MULTIPART_MARKER {
                    if body.len() < 4 {
                        return Err(RconError::PacketError("truncated multipart fragment"));
                    }
                    Packet::CommandFragment {
                        sequence: body[0],
                        total: body[2],
                        index: body[3],
                        part: Bytes::copy_from_slice(&body[4..]),
                    }
                }
                else {
                    Packet::CommandReply {
                        sequence: body[0],
                        data: String::from_utf8_lossy(&body[1..]).into_owned(),
                    }
                }
            }
            (PacketType::Message, PacketDirection::Request) => Packet::MessageAck { sequence: body[0] },
            (PacketType::Message, _) => Packet::MessageIndication {
                sequence: body[0],
                message: String::from_utf8_lossy(&body[1..]).into_owned(),
            },
        };
        Ok(packet)
    }
}
