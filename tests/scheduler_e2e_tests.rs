//! End-to-end scenarios driving the real dispatcher worker through the
//! façade handle, with a channel-backed adapter link standing in for the
//! platform IPC.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use syncd::adapters::AdapterLink;
use syncd::bundle::Bundle;
use syncd::config::AppConfig;
use syncd::data_change::capability_uris;
use syncd::error::SyncError;
use syncd::facade::{self, Scheduler};
use syncd::models::account::LocalAccounts;
use syncd::models::capability::NOT_IN_BACKOFF;
use syncd::models::job::sync_option;
use syncd::models::{AccountId, SyncStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Delivery {
    Start {
        app_id: String,
        account_id: AccountId,
        job_name: String,
        is_data_change: bool,
        extras: Bundle,
    },
    Cancel {
        app_id: String,
        job_name: String,
    },
}

struct ChannelLink {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl AdapterLink for ChannelLink {
    fn start_sync(
        &self,
        app_id: &str,
        account_id: AccountId,
        job_name: &str,
        is_data_change: bool,
        extras: &Bundle,
    ) {
        let _ = self.tx.send(Delivery::Start {
            app_id: app_id.to_string(),
            account_id,
            job_name: job_name.to_string(),
            is_data_change,
            extras: extras.clone(),
        });
    }

    fn cancel_sync(&self, app_id: &str, _: AccountId, job_name: &str, _: bool, _: &Bundle) {
        let _ = self.tx.send(Delivery::Cancel {
            app_id: app_id.to_string(),
            job_name: job_name.to_string(),
        });
    }
}

struct TestBed {
    scheduler: Scheduler,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    _dir: tempfile::TempDir,
}

impl TestBed {
    async fn next_delivery(&mut self) -> Delivery {
        timeout(Duration::from_secs(3), self.deliveries.recv())
            .await
            .expect("timed out waiting for adapter delivery")
            .expect("delivery channel closed")
    }

    fn no_pending_delivery(&mut self) {
        assert!(
            self.deliveries.try_recv().is_err(),
            "unexpected adapter delivery"
        );
    }
}

fn start(tune: impl FnOnce(&mut AppConfig)) -> TestBed {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig {
        data_dir: dir.path().to_path_buf(),
        ..AppConfig::default()
    };
    tune(&mut config);
    let (tx, deliveries) = mpsc::unbounded_channel();
    let scheduler = facade::start(
        Arc::new(config),
        Arc::new(LocalAccounts),
        Arc::new(ChannelLink { tx }),
    )
    .expect("start scheduler");
    TestBed {
        scheduler,
        deliveries,
        _dir: dir,
    }
}

#[tokio::test]
async fn single_on_demand_sync_runs_and_completes() {
    let mut bed = start(|_| {});
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle.wifi_changed(true);

    let mut requested_extras = Bundle::new();
    requested_extras.set("payload", "calendar-delta");
    let id = handle
        .add_on_demand_sync_job("pkg.a", -1, "n1", 0, requested_extras)
        .await
        .unwrap();
    assert_eq!(id, 1);

    match bed.next_delivery().await {
        Delivery::Start {
            app_id,
            account_id,
            job_name,
            is_data_change,
            extras,
        } => {
            assert_eq!(app_id, "app.a");
            assert_eq!(account_id, -1);
            assert_eq!(job_name, "n1");
            assert!(!is_data_change);
            // Client extras pass through the scheduler untouched.
            assert_eq!(extras.get("payload"), Some("calendar-delta"));
        }
        other => panic!("expected start-sync, got {other:?}"),
    }

    handle
        .send_result("pkg.a", "n1", SyncStatus::Success)
        .await
        .unwrap();

    let jobs = handle.get_all_sync_jobs("pkg.a").await.unwrap();
    assert!(jobs.is_empty());

    let repo = bed.scheduler.repository();
    let backoff = repo.get_backoff(None, "").unwrap();
    assert!(!backoff.is_active());

    bed.no_pending_delivery();
    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn expedited_job_preempts_regular_when_capacity_is_full() {
    let mut bed = start(|config| config.worker.max_regular_syncs = 1);
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle.register_adapter("pkg.b", "app.b").await.unwrap();
    handle.wifi_changed(true);

    handle
        .add_on_demand_sync_job("pkg.a", -1, "regular", 0, Bundle::new())
        .await
        .unwrap();
    assert!(matches!(
        bed.next_delivery().await,
        Delivery::Start { app_id, .. } if app_id == "app.a"
    ));

    handle
        .add_on_demand_sync_job("pkg.b", -1, "urgent", sync_option::EXPEDITED, Bundle::new())
        .await
        .unwrap();

    assert!(matches!(
        bed.next_delivery().await,
        Delivery::Cancel { app_id, .. } if app_id == "app.a"
    ));
    assert!(matches!(
        bed.next_delivery().await,
        Delivery::Start { app_id, .. } if app_id == "app.b"
    ));

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn failure_applies_exponential_backoff_and_retries() {
    let mut bed = start(|config| {
        config.worker.retry_delay_ms = 50;
        // Short base delay so the second failure lands after the first
        // backoff window has elapsed and the delay doubles.
        config.worker.backoff_base_ms = 40;
    });
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle.wifi_changed(true);
    handle
        .add_on_demand_sync_job("pkg.a", -1, "n1", 0, Bundle::new())
        .await
        .unwrap();
    assert!(matches!(bed.next_delivery().await, Delivery::Start { .. }));

    handle
        .send_result("pkg.a", "n1", SyncStatus::Failure)
        .await
        .unwrap();

    let repo = bed.scheduler.repository();
    let first = repo.get_backoff(None, "").unwrap();
    assert_eq!(first.delay_ms, 40);
    assert!(first.time_ms > 0);

    // The retry is queued 50 ms out and dispatches again.
    assert!(matches!(bed.next_delivery().await, Delivery::Start { .. }));

    handle
        .send_result("pkg.a", "n1", SyncStatus::Failure)
        .await
        .unwrap();
    let second = repo.get_backoff(None, "").unwrap();
    assert_eq!(second.delay_ms, 80);
    assert!(second.time_ms > first.time_ms);

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn reconnection_clears_all_backoffs() {
    let mut bed = start(|config| {
        // Keep the failed job from retrying into the active set.
        config.worker.retry_delay_ms = 60_000;
    });
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle.wifi_changed(true);
    handle
        .add_on_demand_sync_job("pkg.a", 3, "n1", 0, Bundle::new())
        .await
        .unwrap();
    assert!(matches!(bed.next_delivery().await, Delivery::Start { .. }));
    handle
        .send_result("pkg.a", "n1", SyncStatus::Failure)
        .await
        .unwrap();

    let repo = bed.scheduler.repository();
    assert!(repo.get_backoff(None, "").is_none());
    let account = syncd::models::AccountHandle::new(3, String::new());
    assert!(repo.get_backoff(Some(&account), "").unwrap().is_active());

    handle.wifi_changed(false);
    handle.wifi_changed(true);
    // A request acts as a barrier: the channel is FIFO, so by the time it
    // replies both signals have been processed.
    handle.get_all_sync_jobs("pkg.a").await.unwrap();

    let cleared = repo.get_backoff(Some(&account), "").unwrap();
    assert_eq!(cleared.time_ms, NOT_IN_BACKOFF);
    assert_eq!(cleared.delay_ms, NOT_IN_BACKOFF);

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn periodic_job_fires_immediately_on_first_registration() {
    let mut bed = start(|_| {});
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle.wifi_changed(true);

    let id = handle
        .add_periodic_sync_job("pkg.a", -1, "poll", 600, 0, Bundle::new())
        .await
        .unwrap();
    assert_eq!(id, 1);

    // Never run before, so the first tick finds it ripe.
    match bed.next_delivery().await {
        Delivery::Start { job_name, .. } => assert_eq!(job_name, "poll"),
        other => panic!("expected start-sync, got {other:?}"),
    }

    let repo = bed.scheduler.repository();
    let all = repo.get_copy_of_all_capabilities_and_status();
    assert_eq!(all.len(), 1);
    let (cap, status) = &all[0];
    assert_eq!(cap.periodic_syncs.len(), 1);
    assert_eq!(cap.periodic_syncs[0].period_sec, 600);
    assert!(status.periodic_sync_time(0) > 0);

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn requested_period_below_the_floor_is_coerced() {
    let bed = start(|_| {});
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle
        .add_periodic_sync_job("pkg.a", -1, "fast", 100, 0, Bundle::new())
        .await
        .unwrap();

    let repo = bed.scheduler.repository();
    let all = repo.get_copy_of_all_capabilities_and_status();
    assert_eq!(all[0].0.periodic_syncs[0].period_sec, 300);

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn data_change_event_fans_out_to_registered_jobs() {
    let mut bed = start(|_| {});
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle.wifi_changed(true);

    handle
        .add_data_change_sync_job("pkg.a", -1, capability_uris::CALENDAR, 0, Bundle::new())
        .await
        .unwrap();
    bed.no_pending_delivery();

    handle.data_changed(capability_uris::CALENDAR);
    match bed.next_delivery().await {
        Delivery::Start {
            job_name,
            is_data_change,
            ..
        } => {
            assert_eq!(job_name, capability_uris::CALENDAR);
            assert!(is_data_change);
        }
        other => panic!("expected start-sync, got {other:?}"),
    }

    // An unrelated bucket does not fire this job.
    handle
        .send_result("pkg.a", capability_uris::CALENDAR, SyncStatus::Success)
        .await
        .unwrap();
    handle.data_changed(capability_uris::CONTACT);
    handle.get_all_sync_jobs("pkg.a").await.unwrap();
    bed.no_pending_delivery();

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn unknown_data_change_capability_is_rejected() {
    let bed = start(|_| {});
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    let result = handle
        .add_data_change_sync_job("pkg.a", -1, "calendar", 0, Bundle::new())
        .await;
    assert!(matches!(result, Err(SyncError::InvalidParameter(_))));

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn package_uninstall_releases_every_resource() {
    let mut bed = start(|_| {});
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.x", "app.x").await.unwrap();
    handle.wifi_changed(true);

    handle
        .add_on_demand_sync_job("pkg.x", 1, "active", 0, Bundle::new())
        .await
        .unwrap();
    assert!(matches!(bed.next_delivery().await, Delivery::Start { .. }));
    handle
        .add_periodic_sync_job("pkg.x", 2, "periodic", 3600, 0, Bundle::new())
        .await
        .unwrap();
    handle
        .add_data_change_sync_job("pkg.x", -1, capability_uris::IMAGE, 0, Bundle::new())
        .await
        .unwrap();

    handle.package_uninstalled("pkg.x");
    // Barrier so the uninstall has been processed before asserting.
    let jobs = handle.get_all_sync_jobs("pkg.x").await.unwrap();
    assert!(jobs.is_empty());

    // The active job was told to stop.
    let mut cancelled = false;
    while let Ok(delivery) = bed.deliveries.try_recv() {
        if matches!(&delivery, Delivery::Cancel { app_id, .. } if app_id.as_str() == "app.x") {
            cancelled = true;
        }
    }
    assert!(cancelled, "active job should receive cancel-sync");

    let repo = bed.scheduler.repository();
    assert!(repo
        .get_copy_of_all_capabilities_and_status()
        .iter()
        .all(|(cap, _)| cap.app_id != "app.x"));

    // The id pool was freed along with the registry entry.
    let err = handle
        .add_on_demand_sync_job("pkg.x", -1, "again", 0, Bundle::new())
        .await;
    assert!(matches!(err, Err(SyncError::SyncAdapterNotFound(_))));

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn watchdog_cancels_a_silent_adapter() {
    let mut bed = start(|config| config.worker.watchdog_secs = 1);
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle.wifi_changed(true);
    handle
        .add_on_demand_sync_job("pkg.a", -1, "stuck", 0, Bundle::new())
        .await
        .unwrap();
    assert!(matches!(bed.next_delivery().await, Delivery::Start { .. }));

    // No result arrives; the watchdog fires and the job is cancelled.
    assert!(matches!(
        bed.next_delivery().await,
        Delivery::Cancel { app_id, .. } if app_id == "app.a"
    ));

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn cancel_by_removal_is_idempotent() {
    let mut bed = start(|_| {});
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle.wifi_changed(true);
    let id = handle
        .add_on_demand_sync_job("pkg.a", -1, "n1", 0, Bundle::new())
        .await
        .unwrap();
    assert!(matches!(bed.next_delivery().await, Delivery::Start { .. }));

    handle.remove_sync_job("pkg.a", id).await.unwrap();
    assert!(matches!(bed.next_delivery().await, Delivery::Cancel { .. }));

    // A second removal of the same id is a quiet no-op.
    handle.remove_sync_job("pkg.a", id).await.unwrap();
    bed.no_pending_delivery();

    // Out-of-range ids are rejected.
    let err = handle.remove_sync_job("pkg.a", 0).await;
    assert!(matches!(err, Err(SyncError::InvalidParameter(_))));

    bed.scheduler.shutdown().await;
}

#[tokio::test]
async fn storage_pressure_blocks_dispatch_until_normal() {
    let mut bed = start(|_| {});
    let handle = bed.scheduler.handle();

    handle.register_adapter("pkg.a", "app.a").await.unwrap();
    handle.wifi_changed(true);
    handle.storage_changed(syncd::constraints::StorageLevel::SoftWarning);

    handle
        .add_on_demand_sync_job("pkg.a", -1, "n1", 0, Bundle::new())
        .await
        .unwrap();
    bed.no_pending_delivery();

    handle.storage_changed(syncd::constraints::StorageLevel::Normal);
    assert!(matches!(bed.next_delivery().await, Delivery::Start { .. }));

    bed.scheduler.shutdown().await;
}
