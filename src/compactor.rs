use std::time::Duration;

use tracing::{error, info};

use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::MemoryStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: MemoryStore, threshold: u64) {
    run_compactor_every(store, threshold, CHECK_INTERVAL).await
}

async fn run_compactor_every(store: MemoryStore, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

/// Compact when more than `threshold` events were appended since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_needed(store: &MemoryStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends <= threshold {
        return false;
    }
    match store.compact_wal().await {
        Ok(()) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::cpr::Cpr;
    use crate::model::*;
    use crate::store::{AppointmentStore, StoreTransaction};

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("donorslot_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    async fn churn(store: &MemoryStore, donors: usize) {
        for n in 0..donors {
            let id = Ulid::new();
            store
                .register_donor(Donor {
                    id,
                    cpr: Cpr::parse(&format!("010190{n:04}")).unwrap(),
                    name: format!("donor {n}"),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn below_threshold_is_noop() {
        let store = MemoryStore::open(test_wal_path("noop.wal")).unwrap();
        churn(&store, 3).await;
        assert!(!compact_if_needed(&store, 3).await);
        assert_eq!(store.wal_appends_since_compact().await, 3);
    }

    #[tokio::test]
    async fn above_threshold_compacts() {
        let path = test_wal_path("compacts.wal");
        let store = MemoryStore::open(path.clone()).unwrap();
        churn(&store, 2).await;

        let donor = store.list_donors().await.unwrap()[0].id;
        let start = NaiveDate::from_ymd_opt(2030, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        for _ in 0..5 {
            let mut txn = store.begin(Default::default()).await.unwrap();
            txn.insert_appointment(donor, Span::slot(start)).await.unwrap();
            txn.commit().await.unwrap();
            store.delete_appointment_by_start(donor, start).await.unwrap();
        }
        let size_before = std::fs::metadata(&path).unwrap().len();

        assert!(compact_if_needed(&store, 5).await);
        assert_eq!(store.wal_appends_since_compact().await, 0);
        let size_after = std::fs::metadata(&path).unwrap().len();
        assert!(size_after < size_before, "{size_after} >= {size_before}");

        let reopened = MemoryStore::open(path).unwrap();
        assert_eq!(reopened.list_donors().await.unwrap().len(), 2);
        assert!(reopened.list_appointments().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn background_task_compacts() {
        let store = MemoryStore::open(test_wal_path("background.wal")).unwrap();
        churn(&store, 4).await;

        let task = tokio::spawn(run_compactor_every(
            store.clone(),
            2,
            Duration::from_millis(10),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(store.wal_appends_since_compact().await, 0);
    }
}
