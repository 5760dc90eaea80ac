use std::sync::Arc;
use std::time::{Duration, Instant};

use campfire_core::{MemberId, RoomId, ServerMessage, TransportId};
use dashmap::DashMap;
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound buffer per connection; a slow client sheds broadcast frames
/// instead of backpressuring room-intent processing.
pub const CHANNEL_DEPTH: usize = 64;

const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Which room/member a live connection is joined as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub room_id: RoomId,
    pub member_id: MemberId,
}

struct ConnectionEntry {
    tx: mpsc::Sender<ServerMessage>,
    binding: Option<Binding>,
    last_seen: Instant,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport {0} unreachable")]
    Unreachable(TransportId),
}

/// Accounting for one broadcast pass, mirrored into metrics.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

/// The transport session registry: maps live connections to their
/// ephemeral transport identities and maintains the per-room broadcast
/// groups. Everything here is in-memory and rebuilt implicitly as
/// connections come and go; drift against the durable member list is
/// expected and repaired by the engine's alignment step.
#[derive(Clone)]
pub struct TransportRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    connections: DashMap<TransportId, ConnectionEntry>,
    groups: DashMap<RoomId, DashMap<TransportId, ()>>,
    send_timeout: Duration,
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_TIMEOUT)
    }
}

impl TransportRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                groups: DashMap::new(),
                send_timeout,
            }),
        }
    }

    /// Registers a fresh connection and returns the receiving half of its
    /// outbound channel for the socket writer task.
    pub fn register(&self, transport_id: TransportId) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.inner.connections.insert(
            transport_id,
            ConnectionEntry {
                tx,
                binding: None,
                last_seen: Instant::now(),
            },
        );
        rx
    }

    /// Removes a connection entirely, detaching it from its group first.
    /// Returns the binding it held, if any.
    pub fn unregister(&self, transport_id: TransportId) -> Option<Binding> {
        let binding = self
            .inner
            .connections
            .remove(&transport_id)
            .and_then(|(_, entry)| entry.binding);
        if let Some(binding) = binding {
            self.remove_from_group(binding.room_id, transport_id);
        }
        binding
    }

    pub fn bind(&self, transport_id: TransportId, binding: Binding) {
        if let Some(mut entry) = self.inner.connections.get_mut(&transport_id) {
            entry.binding = Some(binding);
        }
    }

    pub fn unbind(&self, transport_id: TransportId) {
        if let Some(mut entry) = self.inner.connections.get_mut(&transport_id) {
            entry.binding = None;
        }
    }

    pub fn resolve(&self, transport_id: TransportId) -> Option<Binding> {
        self.inner
            .connections
            .get(&transport_id)
            .and_then(|entry| entry.binding)
    }

    pub fn is_live(&self, transport_id: TransportId) -> bool {
        self.inner.connections.contains_key(&transport_id)
    }

    /// Marks heartbeat activity on a connection.
    pub fn touch(&self, transport_id: TransportId) {
        if let Some(mut entry) = self.inner.connections.get_mut(&transport_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Connections with no activity for longer than `timeout`. The caller
    /// turns these into transport-closed intents.
    pub fn stale_connections(&self, timeout: Duration) -> Vec<TransportId> {
        self.inner
            .connections
            .iter()
            .filter(|entry| entry.last_seen.elapsed() > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Adds a transport to a room's broadcast group. Idempotent; the
    /// engine calls this for every live member on every intent, which is
    /// what heals missed adds from earlier reconnects.
    pub fn add_to_group(&self, room_id: RoomId, transport_id: TransportId) {
        self.inner
            .groups
            .entry(room_id)
            .or_default()
            .insert(transport_id, ());
    }

    pub fn remove_from_group(&self, room_id: RoomId, transport_id: TransportId) {
        if let Some(peers) = self.inner.groups.get(&room_id) {
            peers.remove(&transport_id);
        }
        // Decide emptiness without holding the outer guard.
        self.inner
            .groups
            .remove_if(&room_id, |_, peers| peers.is_empty());
    }

    pub fn group_members(&self, room_id: RoomId) -> Vec<TransportId> {
        self.inner
            .groups
            .get(&room_id)
            .map(|peers| peers.iter().map(|peer| *peer.key()).collect())
            .unwrap_or_default()
    }

    /// Direct send to one transport, bounded by the registry's send
    /// timeout. Best-effort: the caller logs and compensates, never
    /// retries here.
    pub async fn send(
        &self,
        transport_id: TransportId,
        message: ServerMessage,
    ) -> Result<(), TransportError> {
        // Clone the sender so no map guard lives across the await.
        let tx = self
            .inner
            .connections
            .get(&transport_id)
            .map(|entry| entry.tx.clone())
            .ok_or(TransportError::Unreachable(transport_id))?;

        tokio::time::timeout(self.inner.send_timeout, tx.send(message))
            .await
            .map_err(|_| TransportError::Unreachable(transport_id))?
            .map_err(|_| TransportError::Unreachable(transport_id))
    }

    /// Fans a message out to every transport in the room's group with
    /// non-blocking sends. Full buffers drop the frame (the sync loop
    /// repairs the client); closed channels evict the connection.
    pub fn broadcast(&self, room_id: RoomId, message: &ServerMessage) -> BroadcastOutcome {
        let mut outcome = BroadcastOutcome::default();

        // Collect senders first so no guards are held while sending.
        let peers: Vec<(TransportId, mpsc::Sender<ServerMessage>)> = self
            .group_members(room_id)
            .into_iter()
            .filter_map(|tid| {
                self.inner
                    .connections
                    .get(&tid)
                    .map(|entry| (tid, entry.tx.clone()))
            })
            .collect();

        for (transport_id, tx) in peers {
            match tx.try_send(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    outcome.dropped += 1;
                    counter!(
                        "campfire_broadcast_drops_total",
                        1,
                        "room_id" => room_id.to_string()
                    );
                    debug!(room = %room_id, transport = %transport_id, "broadcast frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    outcome.closed += 1;
                    warn!(room = %room_id, transport = %transport_id, "evicting closed transport");
                    self.inner.connections.remove(&transport_id);
                    self.remove_from_group(room_id, transport_id);
                }
            }
        }

        outcome
    }
}
