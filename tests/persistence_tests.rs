//! Scheduler state survives a daemon restart: adapters, capabilities,
//! periodic registrations, and still-pending jobs are reloaded from disk.

use std::sync::Arc;

use syncd::adapters::LoggingAdapterLink;
use syncd::bundle::Bundle;
use syncd::config::AppConfig;
use syncd::facade::{self, Scheduler};
use syncd::models::account::LocalAccounts;

fn start(dir: &std::path::Path) -> Scheduler {
    let config = AppConfig {
        data_dir: dir.to_path_buf(),
        ..AppConfig::default()
    };
    facade::start(
        Arc::new(config),
        Arc::new(LocalAccounts),
        Arc::new(LoggingAdapterLink),
    )
    .expect("start scheduler")
}

#[tokio::test]
async fn adapters_and_periodic_syncs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let scheduler = start(dir.path());
        let handle = scheduler.handle();
        handle.register_adapter("pkg.a", "app.a").await.unwrap();
        let mut extras = Bundle::new();
        extras.set("cadence", "hourly");
        handle
            .add_periodic_sync_job("pkg.a", -1, "poll", 3600, 0, extras)
            .await
            .unwrap();
        scheduler.shutdown().await;
    }

    let scheduler = start(dir.path());
    let handle = scheduler.handle();

    let all = scheduler.repository().get_copy_of_all_capabilities_and_status();
    assert_eq!(all.len(), 1);
    let (cap, status) = &all[0];
    assert_eq!(cap.app_id, "app.a");
    assert_eq!(cap.periodic_syncs.len(), 1);
    assert_eq!(cap.periodic_syncs[0].job_name, "poll");
    assert_eq!(cap.periodic_syncs[0].period_sec, 3600);
    assert_eq!(cap.periodic_syncs[0].extras.get("cadence"), Some("hourly"));
    assert_eq!(
        status.periodic_sync_times.len(),
        cap.periodic_syncs.len()
    );

    // The adapter registration was reloaded too: requests resolve without
    // a fresh register call.
    let id = handle
        .add_on_demand_sync_job("pkg.a", -1, "after-restart", 0, Bundle::new())
        .await
        .unwrap();
    assert!(id >= 1);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn pending_jobs_are_reloaded_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let scheduler = start(dir.path());
        let handle = scheduler.handle();
        handle.register_adapter("pkg.a", "app.a").await.unwrap();
        // No network, so the job stays pending and is flushed on shutdown.
        handle
            .add_on_demand_sync_job("pkg.a", -1, "queued", 0, Bundle::new())
            .await
            .unwrap();
        scheduler.shutdown().await;
    }

    let jobs = syncd::repository::persist::read_jobs(dir.path());
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_name, "queued");
    assert_eq!(jobs[0].app_id, "app.a");
    assert_eq!(jobs[0].key, "id:app.a");

    // The reloaded scheduler carries the job in its pending queue; once it
    // is dispatched and succeeds the state is clean again.
    let scheduler = start(dir.path());
    scheduler.shutdown().await;
    let jobs = syncd::repository::persist::read_jobs(dir.path());
    assert_eq!(jobs.len(), 1, "still pending without network");
}

#[tokio::test]
async fn random_offset_is_stable_across_restarts() {
    let dir = tempfile::tempdir().unwrap();

    let first = {
        let scheduler = start(dir.path());
        let offset = scheduler.repository().random_offset_sec();
        scheduler.shutdown().await;
        offset
    };
    assert!((0..86_400).contains(&first));

    let scheduler = start(dir.path());
    assert_eq!(scheduler.repository().random_offset_sec(), first);
    scheduler.shutdown().await;
}
