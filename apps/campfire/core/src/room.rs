use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Identifies a room for its whole lifetime.
pub type RoomId = Uuid;
/// Identifies a member across reconnects.
pub type MemberId = Uuid;
/// Identifies one live connection; reassigned on every reconnect.
pub type TransportId = Uuid;

/// Lifecycle phase of a room. Transitions are one-directional:
/// `Waiting -> Active -> Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    Waiting,
    Active,
    Finished,
}

impl RoomPhase {
    pub fn can_advance_to(self, next: RoomPhase) -> bool {
        matches!(
            (self, next),
            (RoomPhase::Waiting, RoomPhase::Active) | (RoomPhase::Active, RoomPhase::Finished)
        )
    }
}

/// Durable room record. `version` increases with every committed mutation
/// touching the room or its members; snapshots inherit it, which is what
/// lets clients apply "latest wins" without diffing member lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub phase: RoomPhase,
    #[serde(default)]
    pub scenario: Option<String>,
    pub version: u64,
    #[serde(default)]
    pub passphrase_hash: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Room {
    pub fn new(id: RoomId, passphrase_hash: String) -> Self {
        Self {
            id,
            phase: RoomPhase::Waiting,
            scenario: None,
            version: 0,
            passphrase_hash,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Durable member record. At most one row exists per (room, member id);
/// a reconnect overwrites `transport_id` in place instead of inserting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: MemberId,
    pub room_id: RoomId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub transport_id: Option<TransportId>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

/// The unit of truth handed to transports and clients: a room plus its
/// members as of one store read. Consumers replace their local view with it
/// wholesale or ignore it; it is never merged as a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipSnapshot {
    pub room: Room,
    pub members: Vec<Member>,
}

impl MembershipSnapshot {
    /// Canonical member ordering: joined-at, then member id as a stable
    /// tiebreak for members admitted within the same instant.
    pub fn sort_members(&mut self) {
        self.members
            .sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.id.cmp(&b.id)));
    }

    pub fn member_ids(&self) -> BTreeSet<MemberId> {
        self.members.iter().map(|m| m.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// True when both snapshots describe the same member set in the same
    /// room phase. Attribute-only changes compare equal here; callers that
    /// care about those should compare `room.version` instead.
    pub fn same_membership(&self, other: &MembershipSnapshot) -> bool {
        self.room.phase == other.room.phase && self.member_ids() == other.member_ids()
    }
}
