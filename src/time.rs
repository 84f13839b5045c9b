//! Genuineness-verified time.
//!
//! Key expiry and credential recency checks must not trust the device
//! clock alone; a tampered clock would let an expired daily key or a stale
//! credential pass. [`GenuineClock`] anchors time to a server sync and
//! advances it monotonically. Until a sync succeeds (or once it is too
//! old), every time-dependent check fails with [`NoGenuineTime`].

use std::sync::Mutex;
use std::time::Instant;

use thiserror::Error;
use time::{Duration, OffsetDateTime};

use crate::backend::BackendClient;

#[derive(Debug, Clone, Copy, Error)]
#[error("trusted time source could not be established")]
pub struct NoGenuineTime;

struct SyncPoint {
    server: OffsetDateTime,
    monotonic: Instant,
}

pub struct GenuineClock {
    max_sync_age: Duration,
    drift_tolerance: Duration,
    state: Mutex<Option<SyncPoint>>,
}

impl GenuineClock {
    /// `max_sync_age`: how long a server sync stays trusted.
    /// `drift_tolerance`: divergence from the local clock that is logged as
    /// suspected tampering.
    pub fn new(max_sync_age: Duration, drift_tolerance: Duration) -> Self {
        Self {
            max_sync_age,
            drift_tolerance,
            state: Mutex::new(None),
        }
    }

    /// Fetch the trusted timestamp from the backend and anchor the clock.
    pub async fn sync(&self, backend: &dyn BackendClient) -> Result<(), NoGenuineTime> {
        let unix = backend.fetch_server_time().await.map_err(|e| {
            tracing::warn!("server time sync failed: {e}");
            NoGenuineTime
        })?;
        self.record_sync(unix)
    }

    /// Anchor the clock to a known-good server timestamp.
    pub fn record_sync(&self, server_unix: i64) -> Result<(), NoGenuineTime> {
        let server = OffsetDateTime::from_unix_timestamp(server_unix).map_err(|_| NoGenuineTime)?;
        let mut state = self.state.lock().map_err(|_| NoGenuineTime)?;
        *state = Some(SyncPoint {
            server,
            monotonic: Instant::now(),
        });
        Ok(())
    }

    /// The current genuine time.
    ///
    /// Derived from the last server sync plus monotonic elapsed time, never
    /// from the wall clock. Fails if no sync happened or the sync is older
    /// than `max_sync_age`.
    pub fn now(&self) -> Result<OffsetDateTime, NoGenuineTime> {
        let state = self.state.lock().map_err(|_| NoGenuineTime)?;
        let sync = state.as_ref().ok_or(NoGenuineTime)?;
        let elapsed = Duration::try_from(sync.monotonic.elapsed()).map_err(|_| NoGenuineTime)?;
        if elapsed > self.max_sync_age {
            tracing::debug!("time sync is stale, re-sync required");
            return Err(NoGenuineTime);
        }
        let now = sync.server + elapsed;
        let divergence = (now - OffsetDateTime::now_utc()).abs();
        if divergence > self.drift_tolerance {
            tracing::warn!(
                divergence_seconds = divergence.whole_seconds(),
                "local clock diverges from genuine time"
            );
        }
        Ok(now)
    }
}

impl Default for GenuineClock {
    fn default() -> Self {
        Self::new(Duration::days(1), Duration::minutes(5))
    }
}
