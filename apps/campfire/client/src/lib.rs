//! Utilities for clients of the campfire presence service. These helpers
//! keep the eventual web/CLI implementations in sync with the server
//! without copying message shapes across crates: a join-request builder,
//! the local snapshot view with latest-wins application, and the sync-loop
//! ticker that bounds staleness when pushes go missing.

mod sync;
mod view;

pub use sync::{SyncTicker, DEFAULT_SYNC_INTERVAL};
pub use view::{ApplyOutcome, LocalView};

use campfire_core::ClientMessage;

/// Builder for the initial `Join` message a client sends after connecting.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    passphrase: String,
    display_name: Option<String>,
    resume_token: Option<String>,
}

impl JoinRequest {
    pub fn new(passphrase: impl Into<String>) -> Self {
        Self {
            passphrase: passphrase.into(),
            display_name: None,
            resume_token: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Attach the resume token from a previous `Joined` acknowledgement so
    /// the server treats this join as a reconnection of that identity.
    pub fn with_resume_token(mut self, token: impl Into<String>) -> Self {
        self.resume_token = Some(token.into());
        self
    }

    pub fn into_message(self) -> ClientMessage {
        ClientMessage::Join {
            passphrase: self.passphrase,
            display_name: self.display_name,
            resume_token: self.resume_token,
        }
    }
}
