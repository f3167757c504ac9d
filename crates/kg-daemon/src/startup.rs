//! One-time daemon startup tasks (spec §6.1, §6.6): sweeping stale
//! restore-temp blobs left behind by a crashed or interrupted
//! `POST /admin/restore` call.

use kg_blob::BlobStore;
use kg_clock::{Clock, UtcTime};
use kg_error::KgError;
use tracing::info;

const RESTORE_TEMP_BLOB_PREFIX: &str = "restore-temp/";
const STALE_AFTER_SECONDS: i64 = 24 * 60 * 60;

/// Delete any blob under `restore-temp/` whose embedded write timestamp is
/// older than 24h. [`crate::handlers::admin::restore`] writes temp keys as
/// `restore-temp/{unix_seconds}-{id}.json` and deletes its own on success;
/// this only catches ones orphaned by a process crash mid-restore.
pub async fn sweep_stale_restore_blobs(blob: &dyn BlobStore, clock: &dyn Clock) -> Result<usize, KgError> {
    let now = clock.now();
    let keys = blob.list(RESTORE_TEMP_BLOB_PREFIX).await?;
    let mut swept = 0usize;

    for key in keys {
        let Some(written_at) = written_at_from_key(&key) else {
            continue;
        };
        if now.seconds_since(written_at) >= STALE_AFTER_SECONDS {
            blob.delete(&key).await?;
            swept += 1;
        }
    }

    if swept > 0 {
        info!(target: "kg_daemon", swept, "swept stale restore-temp blobs at startup");
    }
    Ok(swept)
}

fn written_at_from_key(key: &str) -> Option<UtcTime> {
    let stem = key.strip_prefix(RESTORE_TEMP_BLOB_PREFIX)?;
    let seconds_part = stem.split('-').next()?;
    let seconds: i64 = seconds_part.parse().ok()?;
    Some(UtcTime::epoch().plus(chrono::Duration::seconds(seconds)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_blob::InMemoryBlobStore;
    use kg_clock::FixedClock;

    #[tokio::test]
    async fn sweeps_only_keys_older_than_24h() {
        let blob = InMemoryBlobStore::new();
        let clock = FixedClock::new(UtcTime::epoch().plus(chrono::Duration::days(2)));

        let old_key = format!("{RESTORE_TEMP_BLOB_PREFIX}0-old.json");
        let fresh_seconds = clock.now().seconds_since(UtcTime::epoch()) - 60;
        let fresh_key = format!("{RESTORE_TEMP_BLOB_PREFIX}{fresh_seconds}-fresh.json");
        blob.put(&old_key, b"{}".to_vec()).await.unwrap();
        blob.put(&fresh_key, b"{}".to_vec()).await.unwrap();

        let swept = sweep_stale_restore_blobs(&blob, &clock).await.unwrap();
        assert_eq!(swept, 1);
        assert!(!blob.exists(&old_key).await.unwrap());
        assert!(blob.exists(&fresh_key).await.unwrap());
    }

    #[test]
    fn ignores_malformed_keys() {
        assert!(written_at_from_key("restore-temp/not-a-number-id.json").is_none());
        assert!(written_at_from_key("other-prefix/123-id.json").is_none());
    }
}
