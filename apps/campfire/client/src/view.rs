use campfire_core::MembershipSnapshot;
use tracing::trace;

/// What `LocalView::apply` did with an incoming snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The snapshot replaced the local view. `membership_changed` is false
    /// when only attributes moved, so UIs can skip a member-list redraw.
    Applied { membership_changed: bool },
    /// The snapshot was older than (or identical to) the current view.
    Ignored,
}

/// Client-side holder of the last applied snapshot.
///
/// Push events and sync responses for adjacent snapshots can arrive in
/// either order; correctness rests on "latest snapshot observed wins", so
/// `apply` replaces the view wholesale iff the incoming room version is
/// newer. Re-applying an identical snapshot is a no-op by construction.
#[derive(Debug, Default)]
pub struct LocalView {
    current: Option<MembershipSnapshot>,
}

impl LocalView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<&MembershipSnapshot> {
        self.current.as_ref()
    }

    pub fn apply(&mut self, mut incoming: MembershipSnapshot) -> ApplyOutcome {
        incoming.sort_members();

        match &self.current {
            // Versions are comparable only within one room; switching rooms
            // always replaces the view.
            Some(current)
                if current.room.id == incoming.room.id
                    && incoming.room.version <= current.room.version =>
            {
                trace!(
                    room = %incoming.room.id,
                    held = current.room.version,
                    incoming = incoming.room.version,
                    "ignoring stale snapshot"
                );
                ApplyOutcome::Ignored
            }
            _ => {
                let membership_changed = self
                    .current
                    .as_ref()
                    .map(|current| !current.same_membership(&incoming))
                    .unwrap_or(true);
                self.current = Some(incoming);
                ApplyOutcome::Applied { membership_changed }
            }
        }
    }
}
