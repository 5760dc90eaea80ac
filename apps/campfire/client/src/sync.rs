use std::time::Duration;

use campfire_core::ClientMessage;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Reference sync cadence; bounds worst-case staleness to one interval.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed-interval scheduler for the self-healing sync loop. The caller owns
/// the transport: each `tick` yields the `Sync` message to send, and the
/// response is applied through [`crate::LocalView`], which makes the whole
/// loop idempotent no matter how many pushes were lost in between.
#[derive(Debug)]
pub struct SyncTicker {
    interval: Interval,
}

impl SyncTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = interval(period);
        // If the transport stalls we want one catch-up pull, not a burst.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub fn with_default_interval() -> Self {
        Self::new(DEFAULT_SYNC_INTERVAL)
    }

    pub async fn tick(&mut self) -> ClientMessage {
        self.interval.tick().await;
        ClientMessage::Sync
    }
}
