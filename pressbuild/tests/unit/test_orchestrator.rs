//! Provisioning run tests against a scripted remote host

use std::sync::atomic::Ordering;

use pressbuild::deploy::fsm::WebsiteStatus;
use pressbuild::errors::ProvisionError;
use pressbuild::models::website::{ConnectionDescriptor, NewWebsite};

use crate::support::{descriptor, Harness, MarkerBlueprint, HOST, SECRET, WEBSITE_ID};

#[tokio::test]
async fn test_full_run_reaches_active() {
    let harness = Harness::new().await;

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    assert_eq!(handle.initial_status().status, WebsiteStatus::Building);

    let report = handle.wait().await.unwrap();
    assert_eq!(report.status, WebsiteStatus::Active);
    assert!(report.error_message.is_none());

    let website = harness.website().await;
    assert_eq!(website.status, WebsiteStatus::Active);
    assert_eq!(website.build_progress.percent, 100);
    assert!(website.build_progress.completed);
    assert_eq!(website.ssl_progress.percent, 100);
    assert!(website.ssl_progress.completed);
    assert!(website.lease.is_none());
    assert!(website.detection.is_some());
    assert_eq!(website.domain, "example.com");

    // every build step lands exactly one progress write
    let build_percents: Vec<u8> = harness
        .store
        .history()
        .iter()
        .map(|w| w.build_progress.percent)
        .collect();
    let mut distinct = build_percents.clone();
    distinct.dedup();
    assert_eq!(distinct, vec![0, 20, 40, 60, 80, 100]);
    assert!(build_percents.windows(2).all(|w| w[0] <= w[1]));

    let ssl_percents: Vec<u8> = harness
        .store
        .history()
        .iter()
        .map(|w| w.ssl_progress.percent)
        .collect();
    assert!(ssl_percents.windows(2).all(|w| w[0] <= w[1]));

    // ssl never moves before the build completes
    for website in harness.store.history() {
        if !website.build_progress.completed {
            assert!(website.ssl_progress.is_zero());
        }
    }

    assert_eq!(harness.orchestrator.active_runs(), 0);
    assert!(harness.notifier.notices().is_empty());
}

#[tokio::test]
async fn test_failing_build_step_stops_the_run() {
    let harness = Harness::new().await;
    harness.remote.fail_step("build_3");

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.status, WebsiteStatus::Failed);

    let website = harness.website().await;
    assert_eq!(website.status, WebsiteStatus::Failed);
    assert_eq!(website.build_progress.percent, 40);
    assert_eq!(website.build_progress.step, 2);
    assert!(!website.build_progress.completed);
    assert!(website.ssl_progress.is_zero());
    assert!(website.lease.is_none());

    let error = website.error_message.unwrap();
    assert!(error.contains("build_3"), "{}", error);
    assert!(!error.contains(HOST), "{}", error);
    assert!(!error.contains("deploy"), "{}", error);

    // first attempt plus two retries, nothing after it
    assert_eq!(harness.remote.apply_count("build_3"), 3);
    assert_eq!(harness.remote.apply_count("build_4"), 0);
    assert!(harness.remote.applies().iter().all(|s| s.starts_with("build_")));

    let notices = harness.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].0, "build");
}

#[tokio::test]
async fn test_replayed_run_changes_nothing_remotely() {
    let harness = Harness::new().await;

    let first = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    assert_eq!(first.wait().await.unwrap().status, WebsiteStatus::Active);
    let applied = harness.remote.applies().len();
    assert_eq!(applied, 9);

    let second = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    assert_eq!(second.wait().await.unwrap().status, WebsiteStatus::Active);

    assert_eq!(harness.remote.applies().len(), applied);
    let website = harness.website().await;
    assert_eq!(website.build_progress.percent, 100);
    assert_eq!(website.ssl_progress.percent, 100);
}

#[tokio::test]
async fn test_certificate_failure_resumes_at_certificate_phase() {
    let harness = Harness::new().await;
    harness.remote.fail_step("ssl_2");

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    assert_eq!(handle.wait().await.unwrap().status, WebsiteStatus::Failed);

    let website = harness.website().await;
    assert!(website.build_progress.completed);
    assert_eq!(website.ssl_progress.step, 1);
    assert!(!website.ssl_progress.completed);
    assert_eq!(harness.notifier.notices()[0].0, "ssl");

    harness.remote.heal_step("ssl_2");
    let build_applies = harness.remote.apply_count("build_1");

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    assert_eq!(handle.initial_status().status, WebsiteStatus::SslProvisioning);
    assert_eq!(handle.wait().await.unwrap().status, WebsiteStatus::Active);

    let website = harness.website().await;
    assert!(website.error_message.is_none());
    assert_eq!(website.ssl_progress.percent, 100);
    assert_eq!(harness.remote.apply_count("build_1"), build_applies);
}

#[tokio::test]
async fn test_concurrent_starts_admit_one_run() {
    let harness = Harness::new().await;
    let (entered, release) = harness.remote.gate_step("build_1");

    let (a, b) = tokio::join!(
        harness.orchestrator.start(WEBSITE_ID, descriptor()),
        harness.orchestrator.start(WEBSITE_ID, descriptor()),
    );
    let (handle, rejected) = match (a, b) {
        (Ok(handle), Err(e)) | (Err(e), Ok(handle)) => (handle, e),
        (Ok(_), Ok(_)) => panic!("both starts accepted"),
        (Err(a), Err(b)) => panic!("both starts rejected: {a} / {b}"),
    };
    assert!(matches!(rejected, ProvisionError::AlreadyRunning(_)));

    entered.notified().await;
    assert_eq!(harness.orchestrator.active_runs(), 1);
    let again = harness.orchestrator.start(WEBSITE_ID, descriptor()).await;
    assert!(matches!(again, Err(ProvisionError::AlreadyRunning(_))));

    release.notify_one();
    assert_eq!(handle.wait().await.unwrap().status, WebsiteStatus::Active);
    assert_eq!(harness.orchestrator.active_runs(), 0);
}

#[tokio::test]
async fn test_cancelled_run_writes_no_further_progress() {
    let harness = Harness::new().await;
    let (entered, release) = harness.remote.gate_step("build_2");

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    entered.notified().await;

    assert!(harness.orchestrator.cancel(WEBSITE_ID));
    let writes_before_cancel = harness.store.history().len();
    release.notify_one();

    let report = handle.wait().await.unwrap();
    assert_eq!(report.status, WebsiteStatus::Failed);
    assert!(report.error_message.is_some());

    let website = harness.website().await;
    assert_eq!(website.status, WebsiteStatus::Failed);
    assert_eq!(website.build_progress.step, 1);
    assert!(website.lease.is_none());
    for website in &harness.store.history()[writes_before_cancel..] {
        assert_eq!(website.build_progress.step, 1);
    }
    assert_eq!(harness.remote.apply_count("build_3"), 0);
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let harness = Harness::new().await;
    harness.remote.auth_fails.store(true, Ordering::SeqCst);

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    assert_eq!(handle.wait().await.unwrap().status, WebsiteStatus::Failed);
    assert_eq!(harness.remote.opens.load(Ordering::SeqCst), 1);

    let website = harness.website().await;
    let error = website.error_message.unwrap();
    assert!(!error.contains(SECRET), "{}", error);
    assert!(!error.contains(HOST), "{}", error);
    assert!(website.build_progress.is_zero());
}

#[tokio::test]
async fn test_refused_connection_is_retried() {
    let harness = Harness::new().await;
    harness.remote.refused_opens.store(2, Ordering::SeqCst);

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    assert_eq!(handle.wait().await.unwrap().status, WebsiteStatus::Active);
    assert_eq!(harness.remote.opens.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_start_rejects_bad_input() {
    let harness = Harness::new().await;

    let err = harness.orchestrator.start("missing", descriptor()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::NotFound(_)));

    let bad = ConnectionDescriptor {
        host: String::new(),
        ..descriptor()
    };
    let err = harness.orchestrator.start(WEBSITE_ID, bad).await.unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidDescriptor(_)));

    assert_eq!(harness.orchestrator.active_runs(), 0);
    assert_eq!(harness.website().await.status, WebsiteStatus::Pending);
}

#[tokio::test]
async fn test_status_view_hides_connection() {
    let harness = Harness::new().await;
    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    handle.wait().await.unwrap();

    let view = harness.orchestrator.get(WEBSITE_ID).await.unwrap();
    let json = serde_json::to_string(&view).unwrap();
    assert!(!json.contains(HOST));
    assert!(!json.contains("cred-1"));
    assert!(json.contains("\"status\":\"active\""));
}

#[tokio::test]
async fn test_shutdown_cancels_active_runs() {
    let harness = Harness::new().await;
    let (entered, release) = harness.remote.gate_step("build_1");

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    entered.notified().await;

    let orchestrator = harness.orchestrator.clone();
    let shutdown = tokio::spawn(async move { orchestrator.shutdown(std::time::Duration::from_secs(5)).await });
    tokio::task::yield_now().await;
    release.notify_one();

    assert_eq!(shutdown.await.unwrap(), 0);
    assert_eq!(handle.wait().await.unwrap().status, WebsiteStatus::Failed);
}

#[tokio::test]
async fn test_cancel_while_connecting_runs_no_commands() {
    let harness = Harness::new().await;
    let (entered, release) = harness.remote.gate_open();

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    entered.notified().await;

    assert!(harness.orchestrator.cancel(WEBSITE_ID));
    let writes_before_cancel = harness.store.history().len();
    release.notify_one();

    let report = handle.wait().await.unwrap();
    assert_eq!(report.status, WebsiteStatus::Failed);
    assert_eq!(harness.remote.commands.load(Ordering::SeqCst), 0);

    let website = harness.website().await;
    assert_eq!(website.status, WebsiteStatus::Failed);
    assert!(website.detection.is_none());
    assert!(website.build_progress.is_zero());
    assert!(website.lease.is_none());

    let after_cancel = &harness.store.history()[writes_before_cancel..];
    assert_eq!(after_cancel.len(), 1);
    assert_eq!(after_cancel[0].status, WebsiteStatus::Failed);
}

#[tokio::test]
async fn test_cancel_after_last_build_step_skips_certificate_phase() {
    let harness = Harness::new().await;
    let (entered, release) = harness
        .store
        .pause_after(|w| w.build_progress.completed && w.status == WebsiteStatus::Building);

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    entered.notified().await;

    assert!(harness.orchestrator.cancel(WEBSITE_ID));
    release.notify_one();

    assert_eq!(handle.wait().await.unwrap().status, WebsiteStatus::Failed);

    let website = harness.website().await;
    assert_eq!(website.status, WebsiteStatus::Failed);
    assert!(website.build_progress.completed);
    assert!(website.ssl_progress.is_zero());
    for website in harness.store.history() {
        assert_ne!(website.status, WebsiteStatus::SslProvisioning);
    }
    assert_eq!(harness.remote.apply_count("ssl_1"), 0);
    assert_eq!(harness.notifier.notices()[0].0, "build");
}

#[tokio::test]
async fn test_empty_build_phase_completes() {
    let harness = Harness::with_blueprint(MarkerBlueprint { build: 0, ssl: 1 }).await;
    harness.remote.fail_step("ssl_1");

    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    assert_eq!(handle.wait().await.unwrap().status, WebsiteStatus::Failed);

    let website = harness.website().await;
    assert_eq!(website.build_progress.percent, 100);
    assert!(website.build_progress.completed);
    assert_eq!(harness.notifier.notices()[0].0, "ssl");

    harness.remote.heal_step("ssl_1");
    let handle = harness.orchestrator.start(WEBSITE_ID, descriptor()).await.unwrap();
    assert_eq!(handle.initial_status().status, WebsiteStatus::SslProvisioning);
    assert_eq!(handle.wait().await.unwrap().status, WebsiteStatus::Active);

    let website = harness.website().await;
    assert!(website.ssl_progress.completed);
    assert_eq!(website.ssl_progress.percent, 100);
}

#[tokio::test]
async fn test_register_rejects_unsafe_id() {
    let harness = Harness::new().await;

    for id in ["../etc", "a/b", ""] {
        let err = harness
            .orchestrator
            .register(NewWebsite {
                id: Some(id.to_string()),
                owner_id: "owner-1".to_string(),
                domain: "example.org".to_string(),
                connection: descriptor(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidWebsite(_)), "{}", id);
    }
}
