use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::connection::ConnectionId;
use crate::error::RconError;
use crate::protocol::Packet;

/// What a completed request resolves to.
#[derive(Debug)]
pub struct CommandResponse {
    pub connection: ConnectionId,
    /// echo of the command string, for command requests
    pub command: Option<String>,
    /// the (possibly reassembled) reply payload
    pub data: Option<String>,
    pub sent: Packet,
    pub received: Option<Packet>,
    pub bytes_sent: usize,
}

pub type Completion = oneshot::Sender<Result<CommandResponse, RconError>>;

/// A request that was transmitted and is waiting for its reply.
///
/// Holds the encoded bytes so retransmissions do not re-serialize, and the attempt counter
///  driving the retry / give-up decisions. The counter starts at 1 (the original send) and
///  never decreases.
pub struct PendingRequest {
    pub packet: Packet,
    pub encoded: Bytes,
    pub bytes_sent: usize,
    pub created: Instant,
    pub attempts: u32,
    completion: Completion,
}

impl PendingRequest {
    pub fn new(packet: Packet, encoded: Bytes, bytes_sent: usize, completion: Completion) -> PendingRequest {
        PendingRequest {
            packet,
            encoded,
            bytes_sent,
            created: Instant::now(),
            attempts: 1,
            completion,
        }
    }

    /// Resolves the caller with a response assembled from this request.
    pub fn succeed(self, connection: ConnectionId, data: Option<String>, received: Option<Packet>) {
        let response = CommandResponse {
            connection,
            command: self.packet.command_text().map(|c| c.to_owned()),
            data,
            sent: self.packet,
            received,
            bytes_sent: self.bytes_sent,
        };
        // the caller may have gone away; that is fine
        let _ = self.completion.send(Ok(response));
    }

    pub fn fail(self, error: RconError) {
        let _ = self.completion.send(Err(error));
    }
}

/// The protocol's sequence space is one byte, so in-flight commands live in a fixed array of
///  256 slots, plus a dedicated slot for the login (which carries no sequence number).
pub struct PendingTable {
    login: Option<PendingRequest>,
    commands: Box<[Option<PendingRequest>; 256]>,
}

impl PendingTable {
    pub fn new() -> PendingTable {
        PendingTable {
            login: None,
            commands: Box::new(std::array::from_fn(|_| None)),
        }
    }

    /// Replaces the in-flight login, handing back the previous one (if any) for the caller to
    ///  reject.
    pub fn register_login(&mut self, request: PendingRequest) -> Option<PendingRequest> {
        self.login.replace(request)
    }

    pub fn take_login(&mut self) -> Option<PendingRequest> {
        self.login.take()
    }

    pub fn has_command(&self, sequence: u8) -> bool {
        self.commands[sequence as usize].is_some()
    }

    /// A sequence number identifies at most one in-flight request; a second registration at an
    ///  occupied slot is a protocol-level overflow.
    pub fn register_command(&mut self, sequence: u8, request: PendingRequest) -> Result<(), RconError> {
        let slot = &mut self.commands[sequence as usize];
        if slot.is_some() {
            return Err(RconError::PacketOverflow);
        }
        *slot = Some(request);
        Ok(())
    }

    pub fn take_command(&mut self, sequence: u8) -> Option<PendingRequest> {
        self.commands[sequence as usize].take()
    }

    pub fn command_mut(&mut self, sequence: u8) -> Option<&mut PendingRequest> {
        self.commands[sequence as usize].as_mut()
    }

    /// Empties the table for connection teardown.
    pub fn drain(&mut self) -> Vec<PendingRequest> {
        self.login.take()
            .into_iter()
            .chain(self.commands.iter_mut().filter_map(Option::take))
            .collect()
    }

    /// One scheduler tick over every pending request: entries past their per-attempt deadline
    ///  are handed back for retransmission (attempt counter already bumped), entries that are
    ///  not due but have exhausted their attempts are removed and handed back as expired.
    pub fn check_timeouts(
        &mut self,
        now: Instant,
        packet_timeout: Duration,
        threshold: u32,
    ) -> (Vec<Bytes>, Vec<PendingRequest>) {
        let mut retransmit = Vec::new();
        let mut expired = Vec::new();

        let slots = std::iter::once(&mut self.login).chain(self.commands.iter_mut());
        for slot in slots {
            let Some(request) = slot else {
                continue;
            };
            if now.saturating_duration_since(request.created) >= packet_timeout * request.attempts {
                request.attempts += 1;
                retransmit.push(request.encoded.clone());
            }
            else if request.attempts >= threshold {
                expired.push(slot.take().expect("slot was just matched"));
            }
        }
        (retransmit, expired)
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
