use serde::{Deserialize, Serialize};

use crate::room::{MemberId, MembershipSnapshot};

/// Messages sent from client to the campfire server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room by passphrase. A resume token, when present, proves the
    /// client is resuming a prior identity rather than joining fresh.
    Join {
        passphrase: String,
        #[serde(default)]
        display_name: Option<String>,
        #[serde(default)]
        resume_token: Option<String>,
    },
    /// Leave the room this connection is joined to.
    Leave,
    /// Pull the authoritative snapshot (the self-healing sync path).
    Sync,
    /// Mutate a session attribute on the room or a member.
    Mutate { mutation: AttributeMutation },
    /// Heartbeat to keep the connection alive.
    Ping,
}

/// Session-attribute mutations. Each one is validated before any store
/// write and then flows through the same reconcile/deliver pipeline as a
/// membership change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "attribute", rename_all = "snake_case")]
pub enum AttributeMutation {
    /// Assign the scenario and advance the room `Waiting -> Active`.
    RoomScenario { scenario: String },
    /// Advance the room `Active -> Finished`.
    RoomFinished,
    /// Assign a role to a member of the room.
    MemberRole { member_id: MemberId, role: String },
}

/// Messages sent from the campfire server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Acknowledges a successful join on the issuing connection.
    Joined {
        member_id: MemberId,
        resume_token: String,
        snapshot: MembershipSnapshot,
    },
    /// Membership-changed push. Carries the full fresh snapshot, never a
    /// delta, so a receiver that missed earlier events still ends up
    /// correct.
    Event {
        kind: EventKind,
        snapshot: MembershipSnapshot,
    },
    /// Direct response to a `Sync` pull.
    SyncResponse { snapshot: MembershipSnapshot },
    /// Response to `Ping`.
    Pong,
    /// An intent failed outright.
    Error { kind: ErrorKind, message: String },
}

/// What triggered a pushed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MemberJoined,
    MemberLeft,
    AttributeChanged,
}

/// Failure categories surfaced to clients. Transport-layer failures are
/// absorbed server-side and never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown room or member; not retried.
    NotFound,
    /// Durable store unreachable; the client should retry the whole intent.
    StoreUnavailable,
    /// Malformed attribute mutation; rejected before any store write.
    InvalidAttribute,
    /// The frame could not be understood at all.
    Protocol,
}
