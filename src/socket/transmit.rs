use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::connection::ConnectionId;
use crate::error::RconError;
use crate::event::SocketEvent;
use crate::protocol::Packet;

/// A connection's capability to put packets on the wire.
///
/// The socket owns its connections; handing each connection one of these (instead of a
///  reference back to the socket) keeps the ownership graph acyclic. Cheap to clone.
#[derive(Clone)]
pub struct Transmitter {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    connection: ConnectionId,
    events: mpsc::Sender<SocketEvent>,
    open: Arc<AtomicBool>,
}

impl Transmitter {
    pub fn new(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        connection: ConnectionId,
        events: mpsc::Sender<SocketEvent>,
        open: Arc<AtomicBool>,
    ) -> Transmitter {
        Transmitter {
            socket,
            remote,
            connection,
            events,
            open,
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Serializes and transmits a packet, announcing it on the socket's event queue. Returns
    ///  the encoded bytes (for the pending table) and the datagram size.
    pub async fn send(&self, packet: &Packet) -> Result<(Bytes, usize), RconError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RconError::NoConnection);
        }
        let buf = packet.serialize()?;
        let bytes = self.socket.send_to(&buf, self.remote).await?;
        trace!(remote = %self.remote, len = bytes, "sent packet");

        let event = SocketEvent::Sent {
            connection: self.connection,
            remote: self.remote,
            packet: packet.clone(),
            buffer: buf.clone(),
            bytes,
        };
        if let Err(e) = self.events.try_send(event) {
            warn!("socket event queue saturated, dropping event: {}", e);
        }
        Ok((buf, bytes))
    }

    /// Retransmits previously encoded bytes. Deliberately quiet: retries are invisible until
    ///  the retry threshold is crossed.
    pub async fn send_raw(&self, buf: &[u8]) -> Result<usize, RconError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RconError::NoConnection);
        }
        let bytes = self.socket.send_to(buf, self.remote).await?;
        trace!(remote = %self.remote, len = bytes, "retransmitted packet");
        Ok(bytes)
    }
}
