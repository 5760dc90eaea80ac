use std::sync::Arc;
use std::time::Duration;

use campfire_core::{
    AttributeMutation, EventKind, MemberId, MembershipSnapshot, RoomId, RoomPhase, ServerMessage,
    TransportId,
};
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::delivery::DeliveryPipeline;
use crate::error::EngineError;
use crate::registry::{Binding, TransportRegistry};
use crate::session;
use crate::storage::MembershipStore;
use crate::tokens::ResumeTokenKeeper;

/// Why a member is being removed. Semantically identical paths; the tag
/// exists for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveCause {
    Explicit,
    TransportClosed,
}

impl LeaveCause {
    fn label(self) -> &'static str {
        match self {
            LeaveCause::Explicit => "explicit",
            LeaveCause::TransportClosed => "transport_closed",
        }
    }
}

/// A membership-affecting intent. Closed set so dispatch is exhaustive at
/// compile time.
#[derive(Debug)]
pub enum Intent {
    Join {
        transport_id: TransportId,
        passphrase: String,
        display_name: Option<String>,
        resume_token: Option<String>,
    },
    Leave {
        transport_id: TransportId,
        cause: LeaveCause,
    },
    Sync {
        transport_id: TransportId,
    },
    Mutate {
        transport_id: TransportId,
        mutation: AttributeMutation,
    },
}

impl Intent {
    fn label(&self) -> &'static str {
        match self {
            Intent::Join { .. } => "join",
            Intent::Leave { .. } => "leave",
            Intent::Sync { .. } => "sync",
            Intent::Mutate { .. } => "mutate",
        }
    }
}

/// Re-derives the authoritative member list from the membership store on
/// every intent, aligns the broadcast group to it, and hands the fresh
/// snapshot to the delivery pipeline.
///
/// The engine is the only writer of member rows. Intents for one room are
/// serialized through a per-room mutex so the store-mutate/snapshot-read
/// pair of one intent never interleaves with another's; intents for
/// different rooms share no locks. Store calls are the only suspension
/// points that can fail an intent; transport calls are best-effort and
/// absorbed.
pub struct ReconcileEngine {
    store: Arc<dyn MembershipStore>,
    registry: TransportRegistry,
    delivery: DeliveryPipeline,
    tokens: ResumeTokenKeeper,
    locks: DashMap<RoomId, Arc<Mutex<()>>>,
}

impl ReconcileEngine {
    pub fn new(
        store: Arc<dyn MembershipStore>,
        registry: TransportRegistry,
        delivery: DeliveryPipeline,
        tokens: ResumeTokenKeeper,
    ) -> Self {
        Self {
            store,
            registry,
            delivery,
            tokens,
            locks: DashMap::new(),
        }
    }

    pub async fn apply(&self, intent: Intent) -> Result<(), EngineError> {
        counter!("campfire_intents_total", 1, "kind" => intent.label());
        let result = match intent {
            Intent::Join {
                transport_id,
                passphrase,
                display_name,
                resume_token,
            } => {
                self.join(transport_id, &passphrase, display_name, resume_token)
                    .await
            }
            Intent::Leave {
                transport_id,
                cause,
            } => self.leave(transport_id, cause).await,
            Intent::Sync { transport_id } => self.sync(transport_id).await,
            Intent::Mutate {
                transport_id,
                mutation,
            } => self.mutate(transport_id, mutation).await,
        };
        if let Err(err) = &result {
            counter!("campfire_intent_failures_total", 1, "reason" => err.metric_label());
        }
        result
    }

    async fn join(
        &self,
        transport_id: TransportId,
        passphrase: &str,
        display_name: Option<String>,
        resume_token: Option<String>,
    ) -> Result<(), EngineError> {
        let hash = session::hash_passphrase(&session::normalize_passphrase(passphrase));
        let room = self
            .store
            .find_room(&hash)
            .await?
            .ok_or(EngineError::NotFound)?;
        let room_id = room.id;

        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        let member_id = self
            .resolve_member_identity(room_id, resume_token.as_deref(), display_name.as_deref())
            .await?;
        self.store
            .upsert_member(room_id, member_id, transport_id, display_name.as_deref())
            .await?;
        self.registry.bind(transport_id, Binding { room_id, member_id });

        let snapshot = self.fresh_snapshot(room_id).await?;
        self.align(&snapshot);

        let resume = self.tokens.mint(room_id, member_id);
        if let Err(err) = self
            .registry
            .send(
                transport_id,
                ServerMessage::Joined {
                    member_id,
                    resume_token: resume,
                    snapshot: snapshot.clone(),
                },
            )
            .await
        {
            // The sync loop will hand the joiner its snapshot.
            warn!(room = %room_id, member = %member_id, %err, "join ack not delivered");
        }

        self.delivery
            .fan_out(EventKind::MemberJoined, snapshot)
            .await;
        self.touch(room_id).await;
        Ok(())
    }

    /// Resolves which stable identity a join intent speaks for.
    ///
    /// A valid resume token for this room is authoritative. Without one,
    /// a best-effort heuristic applies: when exactly one member's last
    /// transport is no longer live (preferring a display-name match), the
    /// join is read as that member resuming; with zero or several
    /// candidates the join is fresh. A token that fails verification also
    /// joins fresh, since it proves nothing.
    async fn resolve_member_identity(
        &self,
        room_id: RoomId,
        resume_token: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<MemberId, EngineError> {
        if let Some(token) = resume_token {
            match self.tokens.verify(token) {
                Ok(claims) if claims.room_id == room_id => return Ok(claims.member_id),
                Ok(claims) => {
                    debug!(token_room = %claims.room_id, %room_id, "resume token for another room")
                }
                Err(err) => debug!(%err, "resume token rejected"),
            }
            return Ok(Uuid::new_v4());
        }

        let Some(snapshot) = self.store.snapshot(room_id).await? else {
            return Ok(Uuid::new_v4());
        };
        let stale: Vec<_> = snapshot
            .members
            .iter()
            .filter(|member| {
                member
                    .transport_id
                    .map(|tid| !self.registry.is_live(tid))
                    .unwrap_or(true)
            })
            .collect();

        if let Some(name) = display_name {
            let named: Vec<_> = stale
                .iter()
                .filter(|member| member.display_name.as_deref() == Some(name))
                .collect();
            if let [member] = named.as_slice() {
                return Ok(member.id);
            }
        }
        if let [member] = stale.as_slice() {
            return Ok(member.id);
        }
        Ok(Uuid::new_v4())
    }

    async fn leave(
        &self,
        transport_id: TransportId,
        cause: LeaveCause,
    ) -> Result<(), EngineError> {
        let Binding { room_id, member_id } = self
            .registry
            .resolve(transport_id)
            .ok_or(EngineError::NotFound)?;

        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        let removed = self.store.remove_member(room_id, member_id).await?;
        self.registry.unbind(transport_id);
        self.registry.remove_from_group(room_id, transport_id);
        debug!(
            room = %room_id,
            member = %member_id,
            cause = cause.label(),
            removed,
            "member left"
        );
        counter!("campfire_leaves_total", 1, "cause" => cause.label());

        let Some(snapshot) = self.store.snapshot(room_id).await? else {
            return Ok(());
        };
        self.align(&snapshot);

        let empty_waiting =
            snapshot.is_empty() && snapshot.room.phase == RoomPhase::Waiting;
        self.delivery.fan_out(EventKind::MemberLeft, snapshot).await;

        if empty_waiting && self.store.reap_room_if_idle(room_id).await? {
            self.locks.remove(&room_id);
            info!(room = %room_id, "reaped empty waiting room");
            counter!("campfire_rooms_reaped_total", 1);
        }
        Ok(())
    }

    /// The server half of the self-healing loop: answer with the current
    /// snapshot over the direct path only: no broadcast, no group side
    /// effects beyond the requester.
    async fn sync(&self, transport_id: TransportId) -> Result<(), EngineError> {
        let binding = self
            .registry
            .resolve(transport_id)
            .ok_or(EngineError::NotFound)?;

        let lock = self.room_lock(binding.room_id);
        let _guard = lock.lock().await;

        let snapshot = self.fresh_snapshot(binding.room_id).await?;
        if let Err(err) = self
            .registry
            .send(transport_id, ServerMessage::SyncResponse { snapshot })
            .await
        {
            debug!(%err, "sync response not delivered");
        }
        Ok(())
    }

    async fn mutate(
        &self,
        transport_id: TransportId,
        mutation: AttributeMutation,
    ) -> Result<(), EngineError> {
        let binding = self
            .registry
            .resolve(transport_id)
            .ok_or(EngineError::NotFound)?;
        let room_id = binding.room_id;

        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        match &mutation {
            AttributeMutation::RoomScenario { scenario } => {
                let scenario = scenario.trim();
                if scenario.is_empty() {
                    return Err(EngineError::InvalidAttribute(
                        "scenario must not be empty".into(),
                    ));
                }
                let room = self.store.room(room_id).await?.ok_or(EngineError::NotFound)?;
                if !room.phase.can_advance_to(RoomPhase::Active) {
                    return Err(EngineError::InvalidAttribute(
                        "scenario can only be assigned to a waiting room".into(),
                    ));
                }
                self.store
                    .advance_room(room_id, RoomPhase::Active, Some(scenario))
                    .await?;
            }
            AttributeMutation::RoomFinished => {
                let room = self.store.room(room_id).await?.ok_or(EngineError::NotFound)?;
                if !room.phase.can_advance_to(RoomPhase::Finished) {
                    return Err(EngineError::InvalidAttribute(
                        "only an active room can finish".into(),
                    ));
                }
                self.store
                    .advance_room(room_id, RoomPhase::Finished, None)
                    .await?;
            }
            AttributeMutation::MemberRole { member_id, role } => {
                let role = role.trim();
                if role.is_empty() {
                    return Err(EngineError::InvalidAttribute("role must not be empty".into()));
                }
                if !self.store.set_member_role(room_id, *member_id, role).await? {
                    return Err(EngineError::InvalidAttribute(
                        "role target is not a member of this room".into(),
                    ));
                }
            }
        }

        let snapshot = self.fresh_snapshot(room_id).await?;
        self.align(&snapshot);
        self.delivery
            .fan_out(EventKind::AttributeChanged, snapshot)
            .await;
        self.touch(room_id).await;
        Ok(())
    }

    /// Periodically surfaces silent connections as transport-closed
    /// intents so their members do not linger as ghosts.
    pub fn spawn_heartbeat_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for transport_id in engine.registry.stale_connections(timeout) {
                    info!(transport = %transport_id, "pruning stale connection");
                    match engine
                        .apply(Intent::Leave {
                            transport_id,
                            cause: LeaveCause::TransportClosed,
                        })
                        .await
                    {
                        Ok(()) | Err(EngineError::NotFound) => {}
                        Err(err) => warn!(transport = %transport_id, %err, "stale prune failed"),
                    }
                    engine.registry.unregister(transport_id);
                }
            }
        })
    }

    fn room_lock(&self, room_id: RoomId) -> Arc<Mutex<()>> {
        self.locks.entry(room_id).or_default().clone()
    }

    async fn fresh_snapshot(&self, room_id: RoomId) -> Result<MembershipSnapshot, EngineError> {
        self.store
            .snapshot(room_id)
            .await?
            .ok_or(EngineError::NotFound)
    }

    /// Alignment: command the registry to hold every live member's
    /// transport in the room's broadcast group, regardless of whether it
    /// is believed to already be there. Runs before every fan-out, not
    /// only on join, so drift from missed adds heals on the next intent.
    fn align(&self, snapshot: &MembershipSnapshot) {
        for member in &snapshot.members {
            if let Some(transport_id) = member.transport_id {
                if self.registry.is_live(transport_id) {
                    self.registry.add_to_group(snapshot.room.id, transport_id);
                }
            }
        }
    }

    async fn touch(&self, room_id: RoomId) {
        if let Err(err) = self.store.touch(room_id).await {
            debug!(room = %room_id, %err, "ttl refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use campfire_core::Member;
    use tokio::sync::mpsc;

    const PASSPHRASE: &str = "ember-otter-42";

    struct Harness {
        engine: Arc<ReconcileEngine>,
        registry: TransportRegistry,
        store: Arc<MemoryStore>,
    }

    struct TestClient {
        transport_id: TransportId,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl TestClient {
        fn drain(&mut self) {
            while self.rx.try_recv().is_ok() {}
        }

        /// Every buffered message, in arrival order.
        fn pending(&mut self) -> Vec<ServerMessage> {
            let mut messages = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                messages.push(message);
            }
            messages
        }

        /// Highest-version snapshot among buffered pushes, applied the way
        /// a real client would (latest wins).
        fn latest_snapshot(&mut self) -> Option<MembershipSnapshot> {
            let mut latest: Option<MembershipSnapshot> = None;
            for message in self.pending() {
                let snapshot = match message {
                    ServerMessage::Joined { snapshot, .. } => snapshot,
                    ServerMessage::Event { snapshot, .. } => snapshot,
                    ServerMessage::SyncResponse { snapshot } => snapshot,
                    _ => continue,
                };
                let newer = latest
                    .as_ref()
                    .map(|held| snapshot.room.version > held.room.version)
                    .unwrap_or(true);
                if newer {
                    latest = Some(snapshot);
                }
            }
            latest
        }
    }

    async fn harness_with_room() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let hash = session::hash_passphrase(&session::normalize_passphrase(PASSPHRASE));
        store.create_room(&hash).await.unwrap();

        let registry = TransportRegistry::default();
        let delivery = DeliveryPipeline::new(registry.clone());
        let tokens =
            ResumeTokenKeeper::new(b"engine-test-secret".to_vec(), time::Duration::hours(1));
        let dyn_store: Arc<dyn MembershipStore> = store.clone();
        let engine = Arc::new(ReconcileEngine::new(
            dyn_store,
            registry.clone(),
            delivery,
            tokens,
        ));
        Harness {
            engine,
            registry,
            store,
        }
    }

    fn connect(harness: &Harness) -> TestClient {
        let transport_id = Uuid::new_v4();
        let rx = harness.registry.register(transport_id);
        TestClient { transport_id, rx }
    }

    async fn join(
        harness: &Harness,
        client: &mut TestClient,
        display_name: Option<&str>,
        resume_token: Option<String>,
    ) -> (MemberId, String, MembershipSnapshot) {
        harness
            .engine
            .apply(Intent::Join {
                transport_id: client.transport_id,
                passphrase: PASSPHRASE.into(),
                display_name: display_name.map(str::to_string),
                resume_token,
            })
            .await
            .unwrap();

        for message in client.pending() {
            if let ServerMessage::Joined {
                member_id,
                resume_token,
                snapshot,
            } = message
            {
                return (member_id, resume_token, snapshot);
            }
        }
        panic!("join acknowledgement missing");
    }

    fn member<'a>(snapshot: &'a MembershipSnapshot, id: MemberId) -> &'a Member {
        snapshot
            .members
            .iter()
            .find(|member| member.id == id)
            .expect("member present")
    }

    #[tokio::test]
    async fn joining_twice_with_token_keeps_one_member_row() {
        let harness = harness_with_room().await;
        let mut first = connect(&harness);
        let (member_id, token, snapshot) = join(&harness, &mut first, Some("ada"), None).await;
        assert_eq!(snapshot.members.len(), 1);

        let mut second = connect(&harness);
        let (resumed, _, snapshot) =
            join(&harness, &mut second, None, Some(token)).await;

        assert_eq!(resumed, member_id);
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(
            member(&snapshot, member_id).transport_id,
            Some(second.transport_id)
        );
        // The reconnect must not have discarded the original profile.
        assert_eq!(
            member(&snapshot, member_id).display_name.as_deref(),
            Some("ada")
        );
    }

    #[tokio::test]
    async fn reconnect_after_silent_drop_preserves_identity() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        let (member_a, token_a, _) = join(&harness, &mut a, Some("ada"), None).await;
        let mut b = connect(&harness);
        let (member_b, _, snapshot) = join(&harness, &mut b, Some("bei"), None).await;
        assert_eq!(snapshot.members.len(), 2);

        // a's transport dies without a close frame.
        harness.registry.unregister(a.transport_id);

        let mut a2 = connect(&harness);
        let (resumed, _, snapshot) = join(&harness, &mut a2, Some("ada"), Some(token_a)).await;
        assert_eq!(resumed, member_a);
        assert_eq!(
            snapshot.member_ids(),
            [member_a, member_b].into_iter().collect()
        );
        assert_eq!(
            member(&snapshot, member_a).transport_id,
            Some(a2.transport_id)
        );
    }

    #[tokio::test]
    async fn tokenless_reconnect_matches_single_stale_member() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        let (member_a, _, _) = join(&harness, &mut a, Some("ada"), None).await;
        let mut b = connect(&harness);
        join(&harness, &mut b, Some("bei"), None).await;

        harness.registry.unregister(a.transport_id);

        let mut a2 = connect(&harness);
        let (resumed, _, snapshot) = join(&harness, &mut a2, Some("ada"), None).await;
        assert_eq!(resumed, member_a);
        assert_eq!(snapshot.members.len(), 2);
    }

    #[tokio::test]
    async fn ambiguous_tokenless_reconnect_joins_fresh() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        join(&harness, &mut a, None, None).await;
        let mut b = connect(&harness);
        join(&harness, &mut b, None, None).await;

        // Both offline at once: the heuristic has no single candidate.
        harness.registry.unregister(a.transport_id);
        harness.registry.unregister(b.transport_id);

        let mut c = connect(&harness);
        let (_, _, snapshot) = join(&harness, &mut c, None, None).await;
        assert_eq!(snapshot.members.len(), 3);
    }

    #[tokio::test]
    async fn join_with_unknown_passphrase_is_not_found() {
        let harness = harness_with_room().await;
        let client = connect(&harness);

        let err = harness
            .engine
            .apply(Intent::Join {
                transport_id: client.transport_id,
                passphrase: "wrong-words".into(),
                display_name: None,
                resume_token: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound));
    }

    #[tokio::test]
    async fn leave_converges_remaining_member_even_if_broadcast_dropped() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        let (member_a, _, _) = join(&harness, &mut a, Some("ada"), None).await;
        let mut b = connect(&harness);
        let (member_b, _, _) = join(&harness, &mut b, Some("bei"), None).await;
        b.drain();

        // Simulate the missed-group case: b was never (or no longer)
        // in the broadcast group when a leaves.
        harness
            .registry
            .remove_from_group(member_b_room(&harness, b.transport_id), b.transport_id);

        harness
            .engine
            .apply(Intent::Leave {
                transport_id: a.transport_id,
                cause: LeaveCause::Explicit,
            })
            .await
            .unwrap();

        let snapshot = b.latest_snapshot().expect("b observed the leave");
        assert_eq!(snapshot.member_ids(), [member_b].into_iter().collect());
        assert!(!snapshot.member_ids().contains(&member_a));
    }

    fn member_b_room(harness: &Harness, transport_id: TransportId) -> RoomId {
        harness.registry.resolve(transport_id).unwrap().room_id
    }

    #[tokio::test]
    async fn duplicate_leave_is_a_not_found_noop() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        join(&harness, &mut a, None, None).await;
        let mut b = connect(&harness);
        join(&harness, &mut b, None, None).await;

        let leave = |transport_id| Intent::Leave {
            transport_id,
            cause: LeaveCause::Explicit,
        };
        harness.engine.apply(leave(a.transport_id)).await.unwrap();
        let err = harness
            .engine
            .apply(leave(a.transport_id))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound));

        b.drain();
        harness
            .engine
            .apply(Intent::Sync {
                transport_id: b.transport_id,
            })
            .await
            .unwrap();
        assert_eq!(b.latest_snapshot().unwrap().members.len(), 1);
    }

    #[tokio::test]
    async fn store_outage_aborts_intent_without_partial_delivery() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        join(&harness, &mut a, None, None).await;
        a.drain();

        harness.store.set_unavailable(true);
        let mut b = connect(&harness);
        let err = harness
            .engine
            .apply(Intent::Join {
                transport_id: b.transport_id,
                passphrase: PASSPHRASE.into(),
                display_name: None,
                resume_token: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert!(a.pending().is_empty(), "no snapshot may leak from a failed intent");

        // The client retries the whole intent once the store returns.
        harness.store.set_unavailable(false);
        let (_, _, snapshot) = join(&harness, &mut b, None, None).await;
        assert_eq!(snapshot.members.len(), 2);
    }

    #[tokio::test]
    async fn attribute_mutations_flow_through_the_same_pipeline() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        let (_, _, _) = join(&harness, &mut a, Some("ada"), None).await;
        let mut b = connect(&harness);
        let (member_b, _, _) = join(&harness, &mut b, Some("bei"), None).await;
        a.drain();
        b.drain();

        harness
            .engine
            .apply(Intent::Mutate {
                transport_id: a.transport_id,
                mutation: AttributeMutation::RoomScenario {
                    scenario: "the-long-night".into(),
                },
            })
            .await
            .unwrap();

        for client in [&mut a, &mut b] {
            let snapshot = client.latest_snapshot().expect("attribute push received");
            assert_eq!(snapshot.room.phase, RoomPhase::Active);
            assert_eq!(snapshot.room.scenario.as_deref(), Some("the-long-night"));
        }

        harness
            .engine
            .apply(Intent::Mutate {
                transport_id: a.transport_id,
                mutation: AttributeMutation::MemberRole {
                    member_id: member_b,
                    role: "storyteller".into(),
                },
            })
            .await
            .unwrap();
        let snapshot = b.latest_snapshot().unwrap();
        assert_eq!(
            member(&snapshot, member_b).role.as_deref(),
            Some("storyteller")
        );
    }

    #[tokio::test]
    async fn malformed_mutations_are_rejected_before_any_write() {
        let harness = harness_with_room().await;
        let mut a = connect(&harness);
        let (_, _, joined_snapshot) = join(&harness, &mut a, None, None).await;
        let version_before = joined_snapshot.room.version;
        a.drain();

        let mutations = [
            AttributeMutation::RoomScenario { scenario: "  ".into() },
            AttributeMutation::MemberRole {
                member_id: Uuid::new_v4(),
                role: "storyteller".into(),
            },
            AttributeMutation::MemberRole {
                member_id: Uuid::new_v4(),
                role: String::new(),
            },
            // Waiting room cannot finish.
            AttributeMutation::RoomFinished,
        ];
        for mutation in mutations {
            let err = harness
                .engine
                .apply(Intent::Mutate {
                    transport_id: a.transport_id,
                    mutation,
                })
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidAttribute(_)), "{err}");
        }

        // Rejected mutations committed nothing and pushed nothing.
        assert!(a.pending().is_empty());
        harness
            .engine
            .apply(Intent::Sync {
                transport_id: a.transport_id,
            })
            .await
            .unwrap();
        assert_eq!(a.latest_snapshot().unwrap().room.version, version_before);
    }

    #[tokio::test]
    async fn scenario_cannot_be_reassigned_once_active() {
        let harness = harness_with_room().await;
        let mut a = connect(&harness);
        join(&harness, &mut a, None, None).await;

        let assign = |scenario: &str| Intent::Mutate {
            transport_id: a.transport_id,
            mutation: AttributeMutation::RoomScenario {
                scenario: scenario.into(),
            },
        };
        harness.engine.apply(assign("first")).await.unwrap();
        let err = harness.engine.apply(assign("second")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidAttribute(_)));
    }

    #[tokio::test]
    async fn empty_waiting_room_is_reaped_but_finished_room_is_kept() {
        let harness = harness_with_room().await;
        let hash = session::hash_passphrase(&session::normalize_passphrase(PASSPHRASE));

        let mut a = connect(&harness);
        join(&harness, &mut a, None, None).await;
        harness
            .engine
            .apply(Intent::Leave {
                transport_id: a.transport_id,
                cause: LeaveCause::Explicit,
            })
            .await
            .unwrap();
        assert!(harness.store.find_room(&hash).await.unwrap().is_none());

        // Same flow, but the room went active first: no reap.
        harness.store.create_room(&hash).await.unwrap();
        let mut b = connect(&harness);
        join(&harness, &mut b, None, None).await;
        harness
            .engine
            .apply(Intent::Mutate {
                transport_id: b.transport_id,
                mutation: AttributeMutation::RoomScenario {
                    scenario: "the-long-night".into(),
                },
            })
            .await
            .unwrap();
        harness
            .engine
            .apply(Intent::Leave {
                transport_id: b.transport_id,
                cause: LeaveCause::TransportClosed,
            })
            .await
            .unwrap();
        let room = harness.store.find_room(&hash).await.unwrap();
        assert_eq!(room.unwrap().phase, RoomPhase::Active);
    }

    #[tokio::test]
    async fn alignment_heals_missing_group_membership_on_any_intent() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        join(&harness, &mut a, None, None).await;
        let mut b = connect(&harness);
        join(&harness, &mut b, None, None).await;
        let room_id = harness.registry.resolve(b.transport_id).unwrap().room_id;
        b.drain();

        harness.registry.remove_from_group(room_id, b.transport_id);
        assert!(!harness.registry.group_members(room_id).contains(&b.transport_id));

        // Any later intent repairs the drift before broadcasting.
        harness
            .engine
            .apply(Intent::Mutate {
                transport_id: a.transport_id,
                mutation: AttributeMutation::RoomScenario {
                    scenario: "the-long-night".into(),
                },
            })
            .await
            .unwrap();

        assert!(harness.registry.group_members(room_id).contains(&b.transport_id));
        assert!(b.latest_snapshot().is_some());
    }

    #[tokio::test]
    async fn sync_answers_the_requester_only() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        join(&harness, &mut a, None, None).await;
        let mut b = connect(&harness);
        join(&harness, &mut b, None, None).await;
        a.drain();
        b.drain();

        harness
            .engine
            .apply(Intent::Sync {
                transport_id: b.transport_id,
            })
            .await
            .unwrap();

        let messages = b.pending();
        assert!(
            matches!(messages.as_slice(), [ServerMessage::SyncResponse { .. }]),
            "sync must answer direct-only: {messages:?}"
        );
        assert!(a.pending().is_empty());
    }

    #[tokio::test]
    async fn observed_snapshot_versions_never_regress() {
        let harness = harness_with_room().await;

        let mut a = connect(&harness);
        join(&harness, &mut a, None, None).await;
        let mut b = connect(&harness);
        join(&harness, &mut b, None, None).await;

        let mut c = connect(&harness);
        join(&harness, &mut c, None, None).await;
        harness
            .engine
            .apply(Intent::Leave {
                transport_id: c.transport_id,
                cause: LeaveCause::Explicit,
            })
            .await
            .unwrap();
        harness
            .engine
            .apply(Intent::Sync {
                transport_id: b.transport_id,
            })
            .await
            .unwrap();

        let mut last = 0;
        for message in b.pending() {
            let version = match message {
                ServerMessage::Joined { snapshot, .. } => snapshot.room.version,
                ServerMessage::Event { snapshot, .. } => snapshot.room.version,
                ServerMessage::SyncResponse { snapshot } => snapshot.room.version,
                _ => continue,
            };
            assert!(version >= last, "version {version} after {last}");
            last = version;
        }
        assert!(last > 0);
    }
}
