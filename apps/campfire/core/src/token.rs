use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::room::{MemberId, RoomId};

/// Claims carried inside a resume token. A client presents these (signed by
/// the server) on `Join` to prove it is resuming a prior identity rather
/// than joining fresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeClaims {
    pub room_id: RoomId,
    pub member_id: MemberId,
    #[serde(with = "time::serde::rfc3339")]
    pub issued_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl ResumeClaims {
    /// Builds a new claims object with the provided TTL.
    pub fn new(room_id: RoomId, member_id: MemberId, ttl: Duration) -> Self {
        let issued_at = OffsetDateTime::now_utc();
        Self {
            room_id,
            member_id,
            issued_at,
            expires_at: issued_at + ttl,
        }
    }

    /// Returns `Ok(())` if the claims have not yet expired.
    pub fn ensure_not_expired(&self, now: OffsetDateTime) -> Result<(), TokenValidationError> {
        if now > self.expires_at {
            Err(TokenValidationError::Expired)
        } else {
            Ok(())
        }
    }
}

/// Errors returned while validating resume claims.
#[derive(Debug, Error)]
pub enum TokenValidationError {
    #[error("token has expired")]
    Expired,
}
