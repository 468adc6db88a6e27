use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::spawn;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::connection::ConnectionId;
use crate::error::RconError;
use crate::protocol::Packet;

/// Capacity of the per-connection and per-socket event queues. Events are dropped with a
///  warning once a consumer falls this far behind.
pub const EVENT_QUEUE_SIZE: usize = 256;

/// Events a single connection emits to application code.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Connected,
    Disconnected(RconError),
    /// an asynchronous chat / console message pushed by the server (already acked by the engine)
    Message { message: String, sequence: u8 },
    /// a command reply arrived; `resolved` is true iff it matched an in-flight request
    Command { data: String, resolved: bool, sequence: u8 },
    Debug(String),
    Error(RconError),
}

/// Events emitted at the socket level, across all connections.
#[derive(Clone, Debug)]
pub enum SocketEvent {
    Listening(SocketAddr),
    Received {
        connection: ConnectionId,
        remote: SocketAddr,
        /// true iff the packet completed an in-flight request
        resolved: bool,
        packet: Packet,
        buffer: Bytes,
    },
    Sent {
        connection: ConnectionId,
        remote: SocketAddr,
        packet: Packet,
        buffer: Bytes,
        bytes: usize,
    },
    Error(RconError),
}

/// Callback-style event consumption. Listeners run on a dispatch task, never under the
///  engine's locks, so they may call back into the engine freely.
#[async_trait::async_trait]
pub trait EventListener<E: Send>: Sync + Send {
    async fn on_event(&self, event: E);
}

/// Fans events pulled from an [mpsc] queue out to registered listeners.
///
/// Purely optional: applications that prefer pulling can consume the queue directly and never
///  construct one of these.
pub struct EventNotifier<E> {
    listeners: RwLock<FxHashMap<Uuid, Arc<dyn EventListener<E>>>>,
}

impl<E: Clone + Send + 'static> EventNotifier<E> {
    pub fn new() -> EventNotifier<E> {
        EventNotifier {
            listeners: Default::default(),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn EventListener<E>>) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.write().await
            .insert(id, listener);
        id
    }

    pub async fn try_remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        match self.listeners.write().await
            .remove(listener_id)
        {
            None => Err(anyhow!("tried to remove a listener that was not (no longer?) registered: {}", listener_id)),
            Some(_) => Ok(()),
        }
    }

    /// Drains the queue until the sending side is dropped, dispatching every event to every
    ///  listener on its own task.
    pub async fn run_loop(&self, mut recv: mpsc::Receiver<E>) {
        while let Some(event) = recv.recv().await {
            let listeners = self.listeners.read().await
                .values()
                .cloned()
                .collect::<Vec<_>>();
            for l in listeners {
                let evt = event.clone();
                spawn(async move { l.on_event(evt).await });
            }
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventNotifier<E> {
    fn default() -> Self {
        Self::new()
    }
}
