use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use campfire_core::{MemberId, ResumeClaims, RoomId, TokenValidationError};
use hmac::{Hmac, Mac};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

type HmacSha256 = Hmac<sha2::Sha256>;

/// Mints and verifies resume tokens: `base64url(claims).base64url(mac)`,
/// with an HMAC-SHA256 tag over the claims payload. Possession of a valid
/// token is what lets a reconnecting client resume its prior member
/// identity instead of joining fresh.
#[derive(Clone)]
pub struct ResumeTokenKeeper {
    secret: Arc<Vec<u8>>,
    ttl: Duration,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token")]
    InvalidFormat,
    #[error("invalid base64 token: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("invalid token payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("token mac mismatch")]
    MacMismatch,
    #[error("token expired")]
    Expired(#[from] TokenValidationError),
}

impl ResumeTokenKeeper {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration) -> Self {
        Self {
            secret: Arc::new(secret.into()),
            ttl,
        }
    }

    pub fn mint(&self, room_id: RoomId, member_id: MemberId) -> String {
        let claims = ResumeClaims::new(room_id, member_id, self.ttl);
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        let encoded = URL_SAFE_NO_PAD.encode(&payload);
        let mac = URL_SAFE_NO_PAD.encode(self.tag(encoded.as_bytes()));
        format!("{encoded}.{mac}")
    }

    pub fn verify(&self, token: &str) -> Result<ResumeClaims, TokenError> {
        let (encoded, mac) = token.split_once('.').ok_or(TokenError::InvalidFormat)?;

        let presented = URL_SAFE_NO_PAD.decode(mac)?;
        let mut verifier = self.mac();
        verifier.update(encoded.as_bytes());
        verifier
            .verify_slice(&presented)
            .map_err(|_| TokenError::MacMismatch)?;

        let payload = URL_SAFE_NO_PAD.decode(encoded)?;
        let claims: ResumeClaims = serde_json::from_slice(&payload)?;
        claims.ensure_not_expired(OffsetDateTime::now_utc())?;
        Ok(claims)
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("hmac accepts keys of any length")
    }

    fn tag(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}
