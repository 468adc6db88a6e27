pub mod transmit;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{error, info, trace, warn};

use crate::connection::config::ConnectionConfig;
use crate::connection::pending::CommandResponse;
use crate::connection::{Connection, ConnectionDetails, ConnectionId};
use crate::error::RconError;
use crate::event::{ConnectionEvent, SocketEvent, EVENT_QUEUE_SIZE};
use crate::protocol::{Packet, PacketDirection};
use crate::socket::transmit::Transmitter;

/// Inbound datagrams larger than this are truncated by the OS; BattlEye packets stay well
///  below it.
const MAX_DATAGRAM_SIZE: usize = 4096;

/// Where the local UDP socket binds.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub ip: IpAddr,
    pub port: u16,
}

impl Default for SocketConfig {
    fn default() -> SocketConfig {
        SocketConfig {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 2310,
        }
    }
}

/// One UDP socket fanned out to any number of remote RCon sessions, routed by the sender's
///  address.
pub struct RconSocket {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    connections: RwLock<FxHashMap<ConnectionId, Arc<Connection>>>,
    events: mpsc::Sender<SocketEvent>,
    open: Arc<AtomicBool>,
    shutdown: Notify,
}

impl RconSocket {
    /// Binds the local socket. The returned receiver carries the socket-level events,
    ///  starting with [SocketEvent::Listening].
    pub async fn bind(config: SocketConfig) -> anyhow::Result<(Arc<RconSocket>, mpsc::Receiver<SocketEvent>)> {
        let socket = Arc::new(UdpSocket::bind((config.ip, config.port)).await?);
        let local_addr = socket.local_addr()?;
        let (events, events_recv) = mpsc::channel(EVENT_QUEUE_SIZE);

        let rcon_socket = Arc::new(RconSocket {
            socket,
            local_addr,
            connections: Default::default(),
            events,
            open: Arc::new(AtomicBool::new(true)),
            shutdown: Notify::new(),
        });

        info!(%local_addr, "rcon socket listening");
        rcon_socket.emit(SocketEvent::Listening(local_addr));
        Ok((rcon_socket, events_recv))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers a connection to a remote endpoint. At most one connection per remote may
    ///  exist. With `auto_connect` the login handshake starts in the background right away;
    ///  otherwise the caller decides when to call [Connection::connect].
    pub async fn connection(
        &self,
        details: ConnectionDetails,
        options: ConnectionConfig,
        auto_connect: bool,
    ) -> Result<(Arc<Connection>, mpsc::Receiver<ConnectionEvent>), RconError> {
        let id = ConnectionId::from_remote(details.remote);

        let mut connections = self.connections.write().await;
        if connections.contains_key(&id) {
            return Err(RconError::ConnectionExists);
        }

        let transmitter = Transmitter::new(
            self.socket.clone(),
            details.remote,
            id,
            self.events.clone(),
            self.open.clone(),
        );
        let (connection, events_recv) = Connection::new(details, options, transmitter);
        connections.insert(id, connection.clone());
        drop(connections);

        if auto_connect {
            let connection = connection.clone();
            tokio::spawn(async move {
                if let Err(e) = connection.connect().await {
                    warn!(connection = ?connection.id(), "auto-connect failed: {}", e);
                }
            });
        }
        Ok((connection, events_recv))
    }

    /// Transmits a packet on behalf of a connection. With `expect_reply` the call registers a
    ///  pending request and resolves once the reply arrives (or the request times out);
    ///  without it the response only carries the byte count.
    pub async fn send(
        &self,
        connection: &Arc<Connection>,
        packet: Packet,
        expect_reply: bool,
    ) -> Result<CommandResponse, RconError> {
        connection.send_packet(packet, expect_reply).await
    }

    /// Receives datagrams and routes them to their connections until the socket errors or
    ///  [RconSocket::shutdown] is called. Run this on its own task.
    pub async fn recv_loop(self: &Arc<Self>) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, remote)) => self.handle_datagram(&buf[..len], remote).await,
                        Err(e) => {
                            error!("socket error, shutting down: {}", e);
                            let reason = RconError::from(e);
                            self.emit(SocketEvent::Error(reason.clone()));
                            self.shutdown_with(reason).await;
                            return;
                        }
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("receive loop stopping");
                    return;
                }
            }
        }
    }

    async fn handle_datagram(self: &Arc<Self>, buf: &[u8], remote: SocketAddr) {
        trace!(%remote, len = buf.len(), "datagram");

        let id = ConnectionId::from_remote(remote);
        let connection = self.connections.read().await.get(&id).cloned();
        let Some(connection) = connection else {
            warn!(%remote, "datagram from unknown remote, dropping");
            self.emit(SocketEvent::Error(RconError::UnknownConnection { id, remote }));
            return;
        };

        let packet = match Packet::from_buffer(buf, PacketDirection::Reply) {
            Ok(packet) => packet,
            Err(e) => {
                // undecodable datagrams are dropped; the session itself is unaffected
                warn!(%remote, "dropping undecodable datagram: {}", e);
                self.emit(SocketEvent::Error(e.clone()));
                connection.emit_error(e);
                return;
            }
        };

        let resolved = connection.handle_packet(packet.clone()).await;
        self.emit(SocketEvent::Received {
            connection: connection.id(),
            remote,
            resolved,
            packet,
            buffer: Bytes::copy_from_slice(buf),
        });
    }

    /// Tears down every connection and stops the receive loop. The socket does not rebind.
    pub async fn shutdown(&self) {
        self.shutdown_with(RconError::ServerDisconnect).await;
    }

    async fn shutdown_with(&self, reason: RconError) {
        self.open.store(false, Ordering::Release);
        // notify_one stores a permit, so the receive loop sees this even if it is busy with a
        // datagram right now
        self.shutdown.notify_one();

        let connections = self.connections.write().await
            .drain()
            .map(|(_, connection)| connection)
            .collect::<Vec<_>>();
        for connection in connections {
            connection.kill(reason.clone()).await;
        }
    }

    fn emit(&self, event: SocketEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "socket event queue saturated, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                trace!("nobody consumes socket events any more");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::protocol::crc::payload_checksum;

    use super::*;

    /// scripted stand-in for a BattlEye server
    struct FakeServer {
        socket: UdpSocket,
    }

    impl FakeServer {
        async fn bind() -> FakeServer {
            FakeServer {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn recv(&self) -> (Vec<u8>, SocketAddr) {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let (len, from) = timeout(Duration::from_secs(2), self.socket.recv_from(&mut buf))
                .await
                .expect("timed out waiting for a client datagram")
                .unwrap();
            (buf[..len].to_vec(), from)
        }

        /// asserts that the client stays quiet for the given window
        async fn expect_silence(&self, window: Duration) {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let received = timeout(window, self.socket.recv_from(&mut buf)).await;
            assert!(received.is_err(), "expected silence, got a datagram");
        }

        /// frames a payload the way a real server would and sends it
        async fn send_payload(&self, to: SocketAddr, payload: &[u8]) {
            let mut buf = Vec::with_capacity(6 + payload.len());
            buf.extend_from_slice(b"BE");
            buf.extend_from_slice(&payload_checksum(payload).to_le_bytes());
            buf.extend_from_slice(payload);
            self.socket.send_to(&buf, to).await.unwrap();
        }
    }

    struct Harness {
        server: FakeServer,
        socket: Arc<RconSocket>,
        socket_events: mpsc::Receiver<SocketEvent>,
        connection: Arc<Connection>,
        events: mpsc::Receiver<ConnectionEvent>,
    }

    async fn setup(options: ConnectionConfig) -> Harness {
        let server = FakeServer::bind().await;
        let (socket, socket_events) = RconSocket::bind(SocketConfig {
            ip: "127.0.0.1".parse().unwrap(),
            port: 0,
        })
        .await
        .unwrap();

        let recv_socket = socket.clone();
        tokio::spawn(async move { recv_socket.recv_loop().await });

        let details = ConnectionDetails {
            remote: server.addr(),
            password: "test".to_string(),
        };
        let (connection, events) = socket.connection(details, options, false).await.unwrap();

        Harness {
            server,
            socket,
            socket_events,
            connection,
            events,
        }
    }

    /// schedulers off, so tests fully control the wire
    fn quiet_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect: false,
            keep_alive: false,
            timeout: false,
            ..Default::default()
        }
    }

    async fn next_event(events: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("event queue closed")
    }

    async fn next_socket_event(events: &mut mpsc::Receiver<SocketEvent>) -> SocketEvent {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a socket event")
            .expect("event queue closed")
    }

    /// drives the login handshake to completion
    async fn login(harness: &mut Harness) {
        let connection = harness.connection.clone();
        let connect = tokio::spawn(async move { connection.connect().await });

        let (buf, client) = harness.server.recv().await;
        assert_eq!(&buf[6..8], b"\xff\x00");
        harness.server.send_payload(client, &[0xff, 0x00, 0x01]).await;

        connect.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut harness.events).await, ConnectionEvent::Connected));
    }

    #[tokio::test]
    async fn test_login_success() {
        let mut harness = setup(quiet_config()).await;

        let connection = harness.connection.clone();
        let connect = tokio::spawn(async move { connection.connect().await });

        let (buf, client) = harness.server.recv().await;
        assert_eq!(&buf[..2], b"BE");
        assert_eq!(&buf[6..], b"\xff\x00test");

        harness.server.send_payload(client, &[0xff, 0x00, 0x01]).await;

        let response = connect.await.unwrap().unwrap();
        assert!(matches!(response.received, Some(Packet::LoginReply { success: true })));
        assert!(harness.connection.is_connected().await);
        assert!(matches!(next_event(&mut harness.events).await, ConnectionEvent::Connected));
    }

    #[tokio::test]
    async fn test_login_rejected_is_terminal() {
        let mut harness = setup(ConnectionConfig {
            reconnect: true,
            reconnect_timeout: Duration::from_millis(50),
            keep_alive: false,
            timeout: false,
            ..Default::default()
        })
        .await;

        let connection = harness.connection.clone();
        let connect = tokio::spawn(async move { connection.connect().await });

        let (_, client) = harness.server.recv().await;
        harness.server.send_payload(client, &[0xff, 0x00, 0x00]).await;

        assert_eq!(connect.await.unwrap().unwrap_err(), RconError::InvalidPassword);
        assert!(matches!(
            next_event(&mut harness.events).await,
            ConnectionEvent::Disconnected(RconError::InvalidPassword)
        ));
        assert!(!harness.connection.is_connected().await);

        // a rejected password must not trigger the reconnect policy
        harness.server.expect_silence(Duration::from_millis(300)).await;
    }

    #[tokio::test]
    async fn test_command_roundtrip() {
        let mut harness = setup(quiet_config()).await;
        login(&mut harness).await;

        let connection = harness.connection.clone();
        let command = tokio::spawn(async move { connection.command("players").await });

        let (buf, client) = harness.server.recv().await;
        assert_eq!(&buf[6..], b"\xff\x01\x00players");

        let mut payload = vec![0xff, 0x01, 0x00];
        payload.extend_from_slice(b"0 players online");
        harness.server.send_payload(client, &payload).await;

        let response = command.await.unwrap().unwrap();
        assert_eq!(response.command.as_deref(), Some("players"));
        assert_eq!(response.data.as_deref(), Some("0 players online"));

        match next_event(&mut harness.events).await {
            ConnectionEvent::Command { data, resolved, sequence } => {
                assert_eq!(data, "0 players online");
                assert!(resolved);
                assert_eq!(sequence, 0);
            }
            other => panic!("expected a command event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut harness = setup(quiet_config()).await;
        login(&mut harness).await;

        let connection = harness.connection.clone();
        let command = tokio::spawn(async move { connection.command("playerz").await });

        let (_, client) = harness.server.recv().await;
        let mut payload = vec![0xff, 0x01, 0x00];
        payload.extend_from_slice(b"Unknown command");
        harness.server.send_payload(client, &payload).await;

        assert_eq!(
            command.await.unwrap().unwrap_err(),
            RconError::UnknownCommand("playerz".to_string())
        );
    }

    #[tokio::test]
    async fn test_multipart_reply() {
        let mut harness = setup(quiet_config()).await;
        login(&mut harness).await;

        let connection = harness.connection.clone();
        let command = tokio::spawn(async move { connection.command("status").await });

        let (_, client) = harness.server.recv().await;
        let mut first = vec![0xff, 0x01, 0x00, 0x00, 0x02, 0x00];
        first.extend_from_slice(b"hello ");
        let mut second = vec![0xff, 0x01, 0x00, 0x00, 0x02, 0x01];
        second.extend_from_slice(b"world");
        harness.server.send_payload(client, &first).await;
        harness.server.send_payload(client, &second).await;

        let response = command.await.unwrap().unwrap();
        assert_eq!(response.data.as_deref(), Some("hello world"));
        assert!(matches!(response.received, Some(Packet::CommandReply { sequence: 0, .. })));
    }

    #[tokio::test]
    async fn test_multipart_gap_fails_with_max_retries() {
        let mut harness = setup(quiet_config()).await;
        login(&mut harness).await;

        let connection = harness.connection.clone();
        let command = tokio::spawn(async move { connection.command("status").await });

        let (_, client) = harness.server.recv().await;
        // only the final fragment of two arrives; with a fresh attempt counter the engine
        // gives up rather than retransmit
        let mut fragment = vec![0xff, 0x01, 0x00, 0x00, 0x02, 0x01];
        fragment.extend_from_slice(b"world");
        harness.server.send_payload(client, &fragment).await;

        assert_eq!(command.await.unwrap().unwrap_err(), RconError::MaxRetries);
    }

    #[tokio::test]
    async fn test_multipart_gap_retransmits_once_threshold_reached() {
        let mut harness = setup(ConnectionConfig {
            multipart_resend_threshold: 1,
            ..quiet_config()
        })
        .await;
        login(&mut harness).await;

        let connection = harness.connection.clone();
        let _command = tokio::spawn(async move { connection.command("status").await });

        let (request, client) = harness.server.recv().await;
        let mut fragment = vec![0xff, 0x01, 0x00, 0x00, 0x02, 0x01];
        fragment.extend_from_slice(b"world");
        harness.server.send_payload(client, &fragment).await;

        // the gap triggers a byte-identical retransmission of the request
        let (retransmitted, _) = harness.server.recv().await;
        assert_eq!(retransmitted, request);
    }

    #[tokio::test]
    async fn test_server_message_is_acked() {
        let mut harness = setup(quiet_config()).await;
        login(&mut harness).await;

        let mut payload = vec![0xff, 0x02, 0x07];
        payload.extend_from_slice(b"Player joined");
        let client = harness.socket.local_addr();
        harness.server.send_payload(client, &payload).await;

        match next_event(&mut harness.events).await {
            ConnectionEvent::Message { message, sequence } => {
                assert_eq!(message, "Player joined");
                assert_eq!(sequence, 7);
            }
            other => panic!("expected a message event, got {:?}", other),
        }

        let (ack, _) = harness.server.recv().await;
        assert_eq!(&ack[6..], b"\xff\x02\x07");
    }

    #[tokio::test]
    async fn test_pending_request_is_retransmitted_then_times_out() {
        let mut harness = setup(ConnectionConfig {
            reconnect: false,
            keep_alive: false,
            timeout: true,
            timeout_interval: Duration::from_millis(30),
            packet_timeout: Duration::from_millis(100),
            packet_timeout_threshold: 2,
            server_timeout: Duration::from_secs(30),
            ..Default::default()
        })
        .await;
        login(&mut harness).await;

        let connection = harness.connection.clone();
        let command = tokio::spawn(async move { connection.command("players").await });

        let (request, _) = harness.server.recv().await;
        // one silent retransmission once the first attempt is past its deadline...
        let (retransmitted, _) = harness.server.recv().await;
        assert_eq!(retransmitted, request);

        // ...then the attempt budget is exhausted
        assert_eq!(command.await.unwrap().unwrap_err(), RconError::ServerTimeout);
    }

    #[tokio::test]
    async fn test_server_silence_disconnects_and_reconnects() {
        let mut harness = setup(ConnectionConfig {
            reconnect: true,
            reconnect_timeout: Duration::from_millis(50),
            keep_alive: false,
            timeout: true,
            timeout_interval: Duration::from_millis(25),
            server_timeout: Duration::from_millis(150),
            ..Default::default()
        })
        .await;
        login(&mut harness).await;

        // the server goes quiet; the next ticks cross the liveness deadline
        assert!(matches!(
            next_event(&mut harness.events).await,
            ConnectionEvent::Disconnected(RconError::ServerTimeout)
        ));

        // the reconnect policy kicks in with a fresh login
        let (buf, client) = harness.server.recv().await;
        assert_eq!(&buf[6..], b"\xff\x00test");
        harness.server.send_payload(client, &[0xff, 0x00, 0x01]).await;
        assert!(matches!(next_event(&mut harness.events).await, ConnectionEvent::Connected));
    }

    #[tokio::test]
    async fn test_keep_alive_pings_with_empty_command() {
        let mut harness = setup(ConnectionConfig {
            reconnect: false,
            keep_alive: true,
            keep_alive_interval: Duration::from_millis(60),
            timeout: false,
            ..Default::default()
        })
        .await;
        login(&mut harness).await;

        let (buf, client) = harness.server.recv().await;
        assert_eq!(&buf[6..], b"\xff\x01\x00");
        harness.server.send_payload(client, &[0xff, 0x01, 0x00]).await;

        // the ping measures its round trip
        loop {
            match next_event(&mut harness.events).await {
                ConnectionEvent::Debug(text) => {
                    assert!(text.contains("keep-alive round trip"));
                    break;
                }
                ConnectionEvent::Command { resolved: true, sequence: 0, .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_sequence_overflow_fails_before_transmission() {
        let mut harness = setup(quiet_config()).await;
        login(&mut harness).await;

        let packet = Packet::CommandRequest { sequence: 5, command: "first".to_string() };
        let socket = harness.socket.clone();
        let connection = harness.connection.clone();
        tokio::spawn(async move { socket.send(&connection, packet, true).await });
        let _ = harness.server.recv().await;

        let packet = Packet::CommandRequest { sequence: 5, command: "second".to_string() };
        let second = harness.socket.send(&harness.connection, packet, true).await;
        assert_eq!(second.unwrap_err(), RconError::PacketOverflow);
    }

    #[tokio::test]
    async fn test_send_without_reply_resolves_with_byte_count() {
        let mut harness = setup(quiet_config()).await;
        login(&mut harness).await;

        let packet = Packet::MessageAck { sequence: 3 };
        let response = harness.socket.send(&harness.connection, packet, false).await.unwrap();
        assert_eq!(response.bytes_sent, 9);
        assert!(response.data.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_refused() {
        let harness = setup(quiet_config()).await;

        let details = ConnectionDetails {
            remote: harness.server.addr(),
            password: "other".to_string(),
        };
        let second = harness.socket.connection(details, quiet_config(), false).await;
        assert!(matches!(second, Err(RconError::ConnectionExists)));
    }

    #[tokio::test]
    async fn test_datagram_from_unknown_remote() {
        let mut harness = setup(quiet_config()).await;
        assert!(matches!(
            next_socket_event(&mut harness.socket_events).await,
            SocketEvent::Listening(_)
        ));

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger.send_to(b"BE....garbage", harness.socket.local_addr()).await.unwrap();

        assert!(matches!(
            next_socket_event(&mut harness.socket_events).await,
            SocketEvent::Error(RconError::UnknownConnection { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupt_datagram_does_not_touch_the_session() {
        let mut harness = setup(quiet_config()).await;
        login(&mut harness).await;

        // valid frame, then one payload bit flipped
        let mut buf = Vec::new();
        let payload = [0xff, 0x01, 0x00, b'x'];
        buf.extend_from_slice(b"BE");
        buf.extend_from_slice(&payload_checksum(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
        let last = buf.len() - 1;
        buf[last] ^= 0x01;
        harness.server.socket.send_to(&buf, harness.socket.local_addr()).await.unwrap();

        assert!(matches!(
            next_event(&mut harness.events).await,
            ConnectionEvent::Error(RconError::PacketError(msg)) if msg.contains("checksum")
        ));
        assert!(harness.connection.is_connected().await);

        // the session keeps working
        let connection = harness.connection.clone();
        let command = tokio::spawn(async move { connection.command("players").await });
        let (_, client) = harness.server.recv().await;
        harness.server.send_payload(client, &[0xff, 0x01, 0x00, b'y']).await;
        assert_eq!(command.await.unwrap().unwrap().data.as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn test_sent_and_received_socket_events() {
        let mut harness = setup(quiet_config()).await;
        assert!(matches!(
            next_socket_event(&mut harness.socket_events).await,
            SocketEvent::Listening(_)
        ));

        login(&mut harness).await;

        match next_socket_event(&mut harness.socket_events).await {
            SocketEvent::Sent { packet, bytes, .. } => {
                assert!(matches!(packet, Packet::LoginRequest { .. }));
                // 6 byte frame header plus FF 00 'test'
                assert_eq!(bytes, 12);
            }
            other => panic!("expected a sent event, got {:?}", other),
        }
        match next_socket_event(&mut harness.socket_events).await {
            SocketEvent::Received { packet, resolved, .. } => {
                assert!(matches!(packet, Packet::LoginReply { success: true }));
                assert!(resolved);
            }
            other => panic!("expected a received event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_kills_every_connection() {
        let mut harness = setup(quiet_config()).await;
        login(&mut harness).await;

        harness.socket.shutdown().await;

        assert!(matches!(
            next_event(&mut harness.events).await,
            ConnectionEvent::Error(RconError::ServerDisconnect)
        ));
        assert!(matches!(
            next_event(&mut harness.events).await,
            ConnectionEvent::Disconnected(RconError::ServerDisconnect)
        ));

        let connection = harness.connection.clone();
        assert_eq!(connection.command("players").await.unwrap_err(), RconError::NoConnection);
    }
}
