//! Retention window and cleanup

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::error::Result;
use crate::store::TrackingStore;

/// Oldest `created_at` kept when retaining `days` days as of `now`.
///
/// Saturates at the earliest representable instant, so a window reaching
/// past it keeps everything.
pub fn cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    Duration::try_days(i64::from(days))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Delete every flow older than `days` days, whatever its status, together
/// with its log entries. Returns the number of flows deleted.
pub async fn purge_older_than(store: &dyn TrackingStore, days: u32) -> Result<u64> {
    let cutoff = cutoff(Utc::now(), days);
    let deleted = store.delete_flows_created_before(cutoff).await?;
    info!(days, %cutoff, deleted, "Retention cleanup finished");
    Ok(deleted)
}
