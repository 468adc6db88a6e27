pub mod config;
pub mod pending;
pub mod reassembly;

use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use rustc_hash::FxHasher;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, trace, warn};

use crate::connection::config::ConnectionConfig;
use crate::connection::pending::{CommandResponse, PendingRequest, PendingTable};
use crate::connection::reassembly::{ReassemblyOutcome, ReassemblyTable};
use crate::error::RconError;
use crate::event::{ConnectionEvent, EVENT_QUEUE_SIZE};
use crate::protocol::Packet;
use crate::socket::transmit::Transmitter;

/// The reply the server sends when it does not know a command.
const UNKNOWN_COMMAND_REPLY: &str = "Unknown command";

/// Stable opaque key identifying a connection by its remote endpoint.
///
/// Derived by hashing the textual `ip:port` so the same remote maps to the same id across
///  program runs; nothing cryptographic is required of it, it is purely a map key.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn from_remote(remote: SocketAddr) -> ConnectionId {
        let mut hasher = FxHasher::default();
        format!("{}:{}", remote.ip(), remote.port()).hash(&mut hasher);
        ConnectionId(hasher.finish())
    }
}

impl Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// What it takes to reach a remote RCon endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionDetails {
    pub remote: SocketAddr,
    pub password: String,
}

/// Everything mutable about a session, guarded by one lock: datagram handlers, scheduler
///  ticks and API calls all serialize here.
struct ConnectionState {
    connected: bool,
    /// next sequence number to hand out; wraps at 256
    sequence: u8,
    last_packet: Instant,
    /// bumped on every (dis)connect; scheduler tasks carrying a stale generation retire
    ///  themselves
    generation: u64,
    pending: PendingTable,
    reassembly: ReassemblyTable,
}

impl ConnectionState {
    fn next_sequence(&mut self) -> u8 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }
}

/// One authenticated session with a remote RCon endpoint.
///
/// Created through the owning socket (`RconSocket::connection`), never directly: the socket
///  routes inbound datagrams here by remote address.
pub struct Connection {
    id: ConnectionId,
    remote: SocketAddr,
    password: String,
    config: ConnectionConfig,
    transmitter: Transmitter,
    events: mpsc::Sender<ConnectionEvent>,
    state: Mutex<ConnectionState>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection{{{:?}@{}}}", self.id, self.remote)
    }
}

impl Connection {
    pub(crate) fn new(
        details: ConnectionDetails,
        config: ConnectionConfig,
        transmitter: Transmitter,
    ) -> (Arc<Connection>, mpsc::Receiver<ConnectionEvent>) {
        let (events, events_recv) = mpsc::channel(EVENT_QUEUE_SIZE);
        let connection = Arc::new(Connection {
            id: ConnectionId::from_remote(details.remote),
            remote: details.remote,
            password: details.password,
            config,
            transmitter,
            events,
            state: Mutex::new(ConnectionState {
                connected: false,
                sequence: 0,
                last_packet: Instant::now(),
                generation: 0,
                pending: PendingTable::new(),
                reassembly: ReassemblyTable::new(),
            }),
        });
        (connection, events_recv)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.connected
    }

    /// Logs in to the remote endpoint. An existing session is torn down locally first. The
    ///  keep-alive and timeout schedulers start here; the call resolves once the server
    ///  accepts or rejects the password (or the login times out).
    pub async fn connect(self: &Arc<Self>) -> Result<CommandResponse, RconError> {
        if self.password.is_empty() {
            return Err(RconError::NoPassword);
        }
        {
            let mut state = self.state.lock().await;
            if state.connected {
                self.do_disconnect(&mut state, RconError::ServerDisconnect).await;
            }
            state.generation += 1;
            state.last_packet = Instant::now();
            debug!(connection = ?self.id, remote = %self.remote, "connecting");
            self.start_schedulers(state.generation);
        }
        self.send_packet(Packet::LoginRequest { password: self.password.clone() }, true).await
    }

    /// Sends a command and resolves with its (possibly reassembled) reply.
    pub async fn command(self: &Arc<Self>, command: &str) -> Result<CommandResponse, RconError> {
        let sequence = {
            let mut state = self.state.lock().await;
            if !state.connected {
                return Err(RconError::NoConnection);
            }
            state.next_sequence()
        };
        self.send_packet(Packet::CommandRequest { sequence, command: command.to_owned() }, true).await
    }

    /// Tears the session down locally. Terminal: no reconnect is scheduled.
    pub async fn disconnect(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        self.do_disconnect(&mut state, RconError::ServerDisconnect).await;
    }

    /// Transmits an arbitrary sendable packet. With `expect_reply` the call registers the
    ///  request and resolves on reply, retry exhaustion or teardown; without it the call
    ///  resolves immediately with the byte count.
    pub async fn send_packet(self: &Arc<Self>, packet: Packet, expect_reply: bool) -> Result<CommandResponse, RconError> {
        if !expect_reply {
            let (_, bytes) = self.transmitter.send(&packet).await?;
            return Ok(CommandResponse {
                connection: self.id,
                command: packet.command_text().map(|c| c.to_owned()),
                data: None,
                sent: packet,
                received: None,
                bytes_sent: bytes,
            });
        }

        let completion = self.send_and_register(packet).await?;
        completion.await.map_err(|_| RconError::ServerDisconnect)?
    }

    async fn send_and_register(
        self: &Arc<Self>,
        packet: Packet,
    ) -> Result<oneshot::Receiver<Result<CommandResponse, RconError>>, RconError> {
        // only requests can expect a reply
        let sequence = match &packet {
            Packet::LoginRequest { .. } => None,
            Packet::CommandRequest { sequence, .. } => Some(*sequence),
            _ => return Err(RconError::InvalidPacket),
        };

        let mut state = self.state.lock().await;
        if let Some(sequence) = sequence {
            // fail before transmission, the slot is still owned by an earlier request
            if state.pending.has_command(sequence) {
                return Err(RconError::PacketOverflow);
            }
        }

        let (buf, bytes) = self.transmitter.send(&packet).await?;
        let (tx, rx) = oneshot::channel();
        let request = PendingRequest::new(packet, buf, bytes, tx);
        match sequence {
            Some(sequence) => state.pending.register_command(sequence, request)?,
            None => {
                if let Some(superseded) = state.pending.register_login(request) {
                    superseded.fail(RconError::ServerDisconnect);
                }
            }
        }
        Ok(rx)
    }

    /// Entry point for every decoded datagram from this connection's remote. Returns whether
    ///  the packet completed an in-flight request.
    pub(crate) async fn handle_packet(self: &Arc<Self>, packet: Packet) -> bool {
        let mut state = self.state.lock().await;
        state.last_packet = Instant::now();

        match packet {
            Packet::LoginReply { success } => {
                let pending = state.pending.take_login();
                let resolved = pending.is_some();
                if success {
                    state.connected = true;
                    debug!(connection = ?self.id, "logged in");
                    self.emit(ConnectionEvent::Connected);
                    if let Some(request) = pending {
                        request.succeed(self.id, None, Some(Packet::LoginReply { success }));
                    }
                }
                else {
                    if let Some(request) = pending {
                        request.fail(RconError::InvalidPassword);
                    }
                    self.do_disconnect(&mut state, RconError::InvalidPassword).await;
                }
                resolved
            }
            Packet::CommandReply { sequence, data } => {
                self.on_command_reply(&mut state, sequence, data).await
            }
            Packet::CommandFragment { sequence, total, index, part } => {
                match state.reassembly.insert(sequence, total, index, part) {
                    Ok(ReassemblyOutcome::Complete(data)) => {
                        // re-enters the reply path as a synthetic, reassembled reply
                        self.on_command_reply(&mut state, sequence, data).await
                    }
                    Ok(ReassemblyOutcome::Stored) => false,
                    Ok(ReassemblyOutcome::MissingFragments) => {
                        self.recover_multipart(&mut state, sequence).await;
                        false
                    }
                    Err(e) => {
                        self.emit(ConnectionEvent::Error(e));
                        false
                    }
                }
            }
            Packet::MessageIndication { sequence, message } => {
                debug!(connection = ?self.id, sequence, "server message");
                self.emit(ConnectionEvent::Message { message, sequence });
                // ack without registering a pending entry - there is no reply to an ack
                if let Err(e) = self.transmitter.send(&Packet::MessageAck { sequence }).await {
                    self.emit(ConnectionEvent::Error(e));
                }
                false
            }
            other => {
                warn!(connection = ?self.id, ?other, "dropping packet only a client would send");
                false
            }
        }
    }

    async fn on_command_reply(self: &Arc<Self>, state: &mut ConnectionState, sequence: u8, data: String) -> bool {
        let pending = state.pending.take_command(sequence);
        let resolved = pending.is_some();
        if let Some(request) = pending {
            if data == UNKNOWN_COMMAND_REPLY {
                let command = request.packet.command_text().unwrap_or("").to_owned();
                request.fail(RconError::UnknownCommand(command));
            }
            else {
                let received = Packet::CommandReply { sequence, data: data.clone() };
                request.succeed(self.id, Some(data.clone()), Some(received));
            }
        }
        self.emit(ConnectionEvent::Command { data, resolved, sequence });
        resolved
    }

    /// The final fragment of a group arrived but earlier fragments are missing. The original
    ///  behavior: retransmit the request once enough attempts were made, otherwise give up.
    async fn recover_multipart(self: &Arc<Self>, state: &mut ConnectionState, sequence: u8) {
        let retransmit = match state.pending.command_mut(sequence) {
            None => return,
            Some(request) if request.attempts >= self.config.multipart_resend_threshold => {
                request.attempts += 1;
                Some(request.encoded.clone())
            }
            Some(_) => None,
        };

        match retransmit {
            Some(buf) => {
                trace!(connection = ?self.id, sequence, "multipart gap, retransmitting request");
                if let Err(e) = self.transmitter.send_raw(&buf).await {
                    self.emit(ConnectionEvent::Error(e));
                }
            }
            None => {
                if let Some(request) = state.pending.take_command(sequence) {
                    request.fail(RconError::MaxRetries);
                }
                state.reassembly.remove(sequence);
            }
        }
    }

    /// Socket-level teardown: surfaces the error, then disconnects.
    pub(crate) async fn kill(self: &Arc<Self>, error: RconError) {
        self.emit(ConnectionEvent::Error(error.clone()));
        let mut state = self.state.lock().await;
        self.do_disconnect(&mut state, error).await;
    }

    fn do_disconnect<'a>(
        self: &'a Arc<Self>,
        state: &'a mut ConnectionState,
        reason: RconError,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            debug!(connection = ?self.id, %reason, "disconnecting");
            state.generation += 1;
            state.connected = false;
            state.sequence = 0;
            for request in state.pending.drain() {
                request.fail(reason.clone());
            }
            state.reassembly.clear();
            self.emit(ConnectionEvent::Disconnected(reason.clone()));

            if reason == RconError::ServerTimeout && self.config.reconnect {
                let connection = Arc::downgrade(self);
                let delay = self.config.reconnect_timeout;
                tokio::spawn(async move {
                    sleep(delay).await;
                    if let Some(connection) = connection.upgrade() {
                        debug!(connection = ?connection.id, "reconnecting after server timeout");
                        if let Err(e) = connection.connect().await {
                            connection.emit(ConnectionEvent::Error(e));
                        }
                    }
                });
            }
        })
    }

    fn start_schedulers(self: &Arc<Self>, generation: u64) {
        if self.config.keep_alive {
            tokio::spawn(keep_alive_loop(Arc::downgrade(self), generation));
        }
        if self.config.timeout {
            tokio::spawn(timeout_loop(Arc::downgrade(self), generation));
        }
    }

    /// One tick of the retry / liveness scheduler. Returns false once this scheduler
    ///  generation is retired.
    async fn timeout_tick(self: &Arc<Self>, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return false;
        }

        let now = Instant::now();
        if now.saturating_duration_since(state.last_packet) >= self.config.server_timeout {
            warn!(connection = ?self.id, "no packet from server within the liveness deadline");
            self.do_disconnect(&mut state, RconError::ServerTimeout).await;
            return false;
        }

        let (retransmit, expired) = state.pending.check_timeouts(
            now,
            self.config.packet_timeout,
            self.config.packet_timeout_threshold,
        );
        for buf in retransmit {
            if let Err(e) = self.transmitter.send_raw(&buf).await {
                self.emit(ConnectionEvent::Error(e));
            }
        }
        for request in expired {
            trace!(connection = ?self.id, sequence = ?request.packet.sequence(), "request ran out of attempts");
            request.fail(RconError::ServerTimeout);
        }
        true
    }

    pub(crate) fn emit_error(&self, error: RconError) {
        self.emit(ConnectionEvent::Error(error));
    }

    fn emit(&self, event: ConnectionEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(connection = ?self.id, ?event, "event queue saturated, dropping event");
            }
            Err(TrySendError::Closed(_)) => {
                trace!(connection = ?self.id, "nobody consumes events any more");
            }
        }
    }
}

async fn keep_alive_loop(connection: Weak<Connection>, generation: u64) {
    let Some(period) = connection.upgrade().map(|c| c.config.keep_alive_interval) else {
        return;
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        {
            let state = connection.state.lock().await;
            if state.generation != generation {
                return;
            }
            if !state.connected {
                continue;
            }
        }

        let started = Instant::now();
        match connection.command("").await {
            Ok(_) => {
                let rtt = started.elapsed();
                debug!(connection = ?connection.id, rtt_millis = rtt.as_millis() as u64, "keep-alive round trip");
                connection.emit(ConnectionEvent::Debug(format!("keep-alive round trip {}ms", rtt.as_millis())));
            }
            Err(e) => {
                error!(connection = ?connection.id, "keep-alive failed: {}", e);
                connection.emit(ConnectionEvent::Error(e));
            }
        }
    }
}

async fn timeout_loop(connection: Weak<Connection>, generation: u64) {
    let Some(period) = connection.upgrade().map(|c| c.config.timeout_interval) else {
        return;
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        if !connection.timeout_tick(generation).await {
            return;
        }
    }
}
