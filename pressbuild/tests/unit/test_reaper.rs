//! Lease reaper tests

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use pressbuild::deploy::fsm::WebsiteStatus;
use pressbuild::models::progress::PhaseProgress;
use pressbuild::models::website::{RunLease, Website};
use pressbuild::storage::store::{MemoryStore, ProgressStore};
use pressbuild::workers::lease_reaper::{self, reap_expired, ABANDONED_MESSAGE};

use crate::support::descriptor;

fn running(id: &str, lease_secs: i64) -> Website {
    let mut website = Website::new(id, "owner-1", "example.com", descriptor());
    website.status = WebsiteStatus::Building;
    website.build_progress = PhaseProgress::default().advance(2, 5, "Creating database");
    website.lease = Some(RunLease {
        run_id: format!("run-{}", id),
        worker: "gone-worker".to_string(),
        expires_at: Utc::now() + chrono::Duration::seconds(lease_secs),
    });
    website
}

#[tokio::test]
async fn test_reaper_releases_expired_leases_only() {
    let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
    store.insert(running("expired", -5)).await.unwrap();
    store.insert(running("live", 60)).await.unwrap();
    store
        .insert(Website::new("idle", "owner-1", "example.org", descriptor()))
        .await
        .unwrap();

    let reaped = reap_expired(store.clone(), Utc::now()).await.unwrap();
    assert_eq!(reaped, 1);

    let expired = store.get("expired").await.unwrap();
    assert_eq!(expired.status, WebsiteStatus::Failed);
    assert_eq!(expired.error_message.as_deref(), Some(ABANDONED_MESSAGE));
    assert!(expired.lease.is_none());
    // progress is kept so a resubmission can see how far it got
    assert_eq!(expired.build_progress.percent, 40);

    let live = store.get("live").await.unwrap();
    assert_eq!(live.status, WebsiteStatus::Building);
    assert!(live.lease.is_some());

    assert_eq!(store.get("idle").await.unwrap().status, WebsiteStatus::Pending);

    // nothing left to release
    assert_eq!(reap_expired(store, Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reaper_loop_stops_on_shutdown() {
    let store: Arc<dyn ProgressStore> = Arc::new(MemoryStore::new());
    store.insert(running("expired", -5)).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let options = lease_reaper::Options {
        interval: Duration::from_millis(5),
    };
    let worker_store = store.clone();
    let worker = tokio::spawn(async move {
        lease_reaper::run(
            &options,
            worker_store,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = rx.await;
            }),
        )
        .await;
    });

    let mut released = false;
    for _ in 0..100 {
        if store.get("expired").await.unwrap().status == WebsiteStatus::Failed {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(released);

    tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .unwrap()
        .unwrap();
}
