use std::time::Duration;

use campfire_core::{EventKind, MembershipSnapshot, ServerMessage, TransportId};
use futures_util::future::join_all;
use metrics::counter;
use tracing::{debug, warn};

use crate::registry::TransportRegistry;

const DEFAULT_DIRECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Pushes a membership-changed event through two independent channels so
/// delivery never depends on a single mechanism being correctly
/// synchronized at send time: one group broadcast (post-alignment), and a
/// per-member direct send that bypasses group membership entirely. Both
/// carry the same payload, the event kind plus the full fresh snapshot,
/// never a delta. Fire-and-forget: failures are logged and counted here
/// and compensated by the sync loop, never retried.
#[derive(Clone)]
pub struct DeliveryPipeline {
    registry: TransportRegistry,
    direct_timeout: Duration,
}

impl DeliveryPipeline {
    pub fn new(registry: TransportRegistry) -> Self {
        Self {
            registry,
            direct_timeout: DEFAULT_DIRECT_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub fn with_direct_timeout(mut self, timeout: Duration) -> Self {
        self.direct_timeout = timeout;
        self
    }

    pub async fn fan_out(&self, kind: EventKind, snapshot: MembershipSnapshot) {
        let room_id = snapshot.room.id;
        let targets: Vec<TransportId> = snapshot
            .members
            .iter()
            .filter_map(|member| member.transport_id)
            .collect();
        let event = ServerMessage::Event { kind, snapshot };

        let outcome = self.registry.broadcast(room_id, &event);
        counter!(
            "campfire_broadcast_deliveries_total",
            outcome.delivered as u64
        );
        debug!(
            room = %room_id,
            kind = ?kind,
            delivered = outcome.delivered,
            dropped = outcome.dropped,
            closed = outcome.closed,
            "group broadcast fanned out"
        );

        // Direct fallback: independent concurrent sends, never serial, so
        // one unreachable transport cannot delay the rest.
        let sends = targets.into_iter().map(|transport_id| {
            let registry = self.registry.clone();
            let event = event.clone();
            async move {
                if let Err(err) = registry.send(transport_id, event).await {
                    counter!("campfire_direct_send_failures_total", 1);
                    debug!(room = %room_id, %err, "direct send skipped");
                }
            }
        });
        let sends: Vec<_> = sends.collect();
        if sends.is_empty() {
            return;
        }
        if tokio::time::timeout(self.direct_timeout, join_all(sends))
            .await
            .is_err()
        {
            warn!(room = %room_id, "direct fan-out timed out");
        }
    }
}
