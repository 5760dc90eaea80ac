//! Shared primitives for the campfire presence synchronization service.
//! Domain types and the wire protocol live here so the server and client
//! crates agree on message shapes without copying them across crates.

pub mod protocol;
pub mod room;
pub mod token;

pub use protocol::{AttributeMutation, ClientMessage, ErrorKind, EventKind, ServerMessage};
pub use room::{Member, MemberId, MembershipSnapshot, Room, RoomId, RoomPhase, TransportId};
pub use token::{ResumeClaims, TokenValidationError};
