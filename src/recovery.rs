use std::{io, time::SystemTime};

use hashbrown::HashMap;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::{
    journal::{instant_at, Journal, Snapshot},
    staging::StagingArea,
    store::RecordStore,
};

/// What startup recovery did with the artifacts it found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Merged into the store.
    pub recovered: usize,
    /// Older than the expiry cutoff, dropped unread.
    pub expired: usize,
    /// Could not be read or parsed, dropped.
    pub corrupt: usize,
    /// Already reflected in the main store file, dropped.
    pub superseded: usize,
}

/// Replays submissions that were staged but never merged because the
/// aggregator stopped in between.
///
/// Artifacts older than `expiry` are dropped, and so is any artifact written
/// no later than the committed record of its source in `committed` (source id
/// to wall-clock receive time, as loaded from the main store file): a commit
/// that outlived its artifact already holds that submission or a newer one.
/// The rest are merged oldest first by modification time, which stands in for
/// their arrival order.
/// The merged store is then written to the journal as `generation`, and only
/// after that is every artifact removed, whatever happened to it. Recovery is
/// not an event anyone outside observed, so it never touches the logical
/// clock.
pub async fn recover(
    staging: &StagingArea,
    store: &mut RecordStore,
    journal: &Journal,
    committed: &HashMap<String, SystemTime>,
    generation: u64,
    expiry: Duration,
) -> io::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let now = SystemTime::now();

    let mut pending = Vec::new();
    for artifact in staging.artifacts().await? {
        let age = now.duration_since(artifact.modified).unwrap_or_default();
        if age > expiry {
            info!(path = %artifact.path.display(), ?age, "dropping expired staged reading");
            staging.discard(&artifact.path).await;
            report.expired += 1;
        } else {
            pending.push(artifact);
        }
    }
    pending.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

    let mut merged = Vec::with_capacity(pending.len());
    for artifact in pending {
        match staging.read(&artifact).await {
            Ok(reading)
                if committed
                    .get(reading.id())
                    .map_or(false, |&at| artifact.modified <= at) =>
            {
                debug!(path = %artifact.path.display(), id = reading.id(), "staged reading already committed");
                report.superseded += 1;
                staging.discard(&artifact.path).await;
            }
            Ok(reading) => {
                let outcome = store.upsert(reading, instant_at(artifact.modified));
                info!(path = %artifact.path.display(), ?outcome, "recovered staged reading");
                report.recovered += 1;
                merged.push(artifact);
            }
            Err(e) => {
                warn!(path = %artifact.path.display(), error = %e, "discarding unreadable staged reading");
                report.corrupt += 1;
                staging.discard(&artifact.path).await;
            }
        }
    }

    journal.write(Snapshot::capture(generation, store)).await?;
    for artifact in merged {
        staging.discard(&artifact.path).await;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::fs::{File, FileTimes};

    use tempfile::TempDir;

    use super::*;
    use crate::{config::Retention, reading::Reading};

    fn reading(id: &str, t: &str) -> Reading {
        Reading::parse(format!(r#"{{"id":"{id}","t":"{t}"}}"#).as_bytes()).unwrap()
    }

    fn set_modified(path: &std::path::Path, at: SystemTime) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_modified(at)).unwrap();
    }

    async fn setup() -> (TempDir, StagingArea, Journal, RecordStore) {
        let tmp = TempDir::new().unwrap();
        let staging = StagingArea::open(tmp.path().join("staging")).await.unwrap();
        let journal = Journal::new(tmp.path().join("store.jsonl"));
        let store = RecordStore::new(20, Retention::LatestPerSource);
        (tmp, staging, journal, store)
    }

    #[tokio::test]
    async fn replays_in_modification_order() {
        let (_tmp, staging, journal, mut store) = setup().await;
        let now = SystemTime::now();
        let newer = staging.stage(&reading("S1", "new")).await.unwrap();
        let older = staging.stage(&reading("S1", "old")).await.unwrap();
        let other = staging.stage(&reading("S2", "x")).await.unwrap();
        set_modified(&older, now - Duration::from_secs(10));
        set_modified(&other, now - Duration::from_secs(5));
        set_modified(&newer, now - Duration::from_secs(1));

        let report = recover(&staging, &mut store, &journal, &HashMap::new(), 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(report, RecoveryReport { recovered: 3, ..Default::default() });

        assert_eq!(store.len(), 2);
        assert_eq!(store.latest_for("S1").unwrap().get("t"), Some("new"));
        assert_eq!(store.latest().unwrap().id(), "S1");
        assert!(staging.artifacts().await.unwrap().is_empty());

        let committed = journal.load().await.unwrap();
        let ids: Vec<_> = committed.iter().map(|(r, _)| r.id()).collect();
        assert_eq!(ids, ["S2", "S1"]);
    }

    #[tokio::test]
    async fn drops_expired_and_corrupt() {
        let (_tmp, staging, journal, mut store) = setup().await;
        let stale = staging.stage(&reading("old", "1")).await.unwrap();
        set_modified(&stale, SystemTime::now() - Duration::from_secs(31));
        std::fs::write(staging.dir().join("broken.json"), b"{\"id\": ").unwrap();
        staging.stage(&reading("ok", "1")).await.unwrap();

        let report = recover(&staging, &mut store, &journal, &HashMap::new(), 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(report, RecoveryReport { recovered: 1, expired: 1, corrupt: 1, superseded: 0 });
        assert_eq!(store.len(), 1);
        assert_eq!(store.latest().unwrap().id(), "ok");
        assert!(staging.artifacts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nothing_staged_leaves_store_alone() {
        let (_tmp, staging, journal, mut store) = setup().await;
        store.upsert(reading("S1", "1"), tokio::time::Instant::now());

        let report = recover(&staging, &mut store, &journal, &HashMap::new(), 1, Duration::from_secs(30)).await.unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert_eq!(store.len(), 1);
        assert_eq!(store.latest_for("S1").unwrap().get("t"), Some("1"));
    }

    #[tokio::test]
    async fn skips_artifacts_a_later_commit_already_covers() {
        let (_tmp, staging, journal, mut store) = setup().await;
        let now = SystemTime::now();
        // S1 v2 was committed after S1 v1 was staged, and v1's artifact
        // survived a crash; S2 has no newer commit and must be replayed
        store.upsert(reading("S1", "2"), instant_at(now));
        let committed: HashMap<String, SystemTime> = [("S1".to_owned(), now)].into_iter().collect();
        let stale = staging.stage(&reading("S1", "1")).await.unwrap();
        set_modified(&stale, now - Duration::from_secs(2));
        let fresh = staging.stage(&reading("S2", "1")).await.unwrap();
        set_modified(&fresh, now - Duration::from_secs(1));

        let report = recover(&staging, &mut store, &journal, &committed, 1, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(report, RecoveryReport { recovered: 1, superseded: 1, ..Default::default() });
        assert_eq!(store.latest_for("S1").unwrap().get("t"), Some("2"));
        assert_eq!(store.latest_for("S2").unwrap().get("t"), Some("1"));
        assert!(staging.artifacts().await.unwrap().is_empty());
    }
}
