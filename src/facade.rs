//! # Request Façade
//!
//! Marshals client requests and device signals into typed messages for the
//! dispatcher worker. Request/reply methods carry a oneshot sender so job
//! ids and duplicate detection are computed on the worker thread while the
//! caller still gets a synchronous answer.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;
use utoipa::ToSchema;

use crate::adapters::AdapterLink;
use crate::bundle::Bundle;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::constraints::{ConstraintEvent, StorageLevel};
use crate::data_change::MediaType;
use crate::dispatcher::{Message, SchedulerWorker};
use crate::error::SyncError;
use crate::models::account::AccountSource;
use crate::models::{AccountId, SyncStatus};
use crate::repository::RepositoryEngine;

/// One registered sync job as reported by `get_all_sync_jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct JobSummary {
    pub sync_job_id: i32,
    pub account_id: AccountId,
    /// Job name, or the capability URI for data-change jobs.
    pub job_name: String,
    pub extras: Bundle,
}

/// Client request surface, transport-neutral.
#[derive(Debug)]
pub enum RequestKind {
    RegisterAdapter {
        package_id: String,
        service_app_id: String,
    },
    UnregisterAdapter {
        package_id: String,
    },
    AddOnDemand {
        package_id: String,
        account_id: AccountId,
        job_name: String,
        sync_option: u32,
        extras: Bundle,
    },
    AddPeriodic {
        package_id: String,
        account_id: AccountId,
        job_name: String,
        period_sec: i64,
        sync_option: u32,
        extras: Bundle,
    },
    AddDataChange {
        package_id: String,
        account_id: AccountId,
        capability: String,
        sync_option: u32,
        extras: Bundle,
    },
    RemoveJob {
        package_id: String,
        sync_job_id: i32,
    },
    GetAllJobs {
        package_id: String,
    },
    SetSyncEnabled {
        enabled: bool,
    },
    SendResult {
        package_id: String,
        job_name: String,
        status: SyncStatus,
    },
}

#[derive(Debug)]
pub enum RequestReply {
    Done,
    JobId(i32),
    Jobs(Vec<JobSummary>),
}

/// A request paired with its reply channel.
#[derive(Debug)]
pub struct ClientRequest {
    pub kind: RequestKind,
    pub reply: oneshot::Sender<Result<RequestReply, SyncError>>,
}

/// Cheap clonable handle used by the HTTP layer, signal sources, and tests
/// to talk to the worker.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl SchedulerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { tx }
    }

    async fn request(&self, kind: RequestKind) -> Result<RequestReply, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Request(ClientRequest { kind, reply }))
            .map_err(|_| SyncError::System("scheduler worker stopped".into()))?;
        rx.await
            .map_err(|_| SyncError::System("scheduler worker dropped the request".into()))?
    }

    fn send(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    pub async fn register_adapter(
        &self,
        package_id: &str,
        service_app_id: &str,
    ) -> Result<(), SyncError> {
        self.request(RequestKind::RegisterAdapter {
            package_id: package_id.to_string(),
            service_app_id: service_app_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn unregister_adapter(&self, package_id: &str) -> Result<(), SyncError> {
        self.request(RequestKind::UnregisterAdapter {
            package_id: package_id.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn add_on_demand_sync_job(
        &self,
        package_id: &str,
        account_id: AccountId,
        job_name: &str,
        sync_option: u32,
        extras: Bundle,
    ) -> Result<i32, SyncError> {
        match self
            .request(RequestKind::AddOnDemand {
                package_id: package_id.to_string(),
                account_id,
                job_name: job_name.to_string(),
                sync_option,
                extras,
            })
            .await?
        {
            RequestReply::JobId(id) => Ok(id),
            other => Err(SyncError::System(format!("unexpected reply {other:?}"))),
        }
    }

    pub async fn add_periodic_sync_job(
        &self,
        package_id: &str,
        account_id: AccountId,
        job_name: &str,
        period_sec: i64,
        sync_option: u32,
        extras: Bundle,
    ) -> Result<i32, SyncError> {
        match self
            .request(RequestKind::AddPeriodic {
                package_id: package_id.to_string(),
                account_id,
                job_name: job_name.to_string(),
                period_sec,
                sync_option,
                extras,
            })
            .await?
        {
            RequestReply::JobId(id) => Ok(id),
            other => Err(SyncError::System(format!("unexpected reply {other:?}"))),
        }
    }

    pub async fn add_data_change_sync_job(
        &self,
        package_id: &str,
        account_id: AccountId,
        capability: &str,
        sync_option: u32,
        extras: Bundle,
    ) -> Result<i32, SyncError> {
        match self
            .request(RequestKind::AddDataChange {
                package_id: package_id.to_string(),
                account_id,
                capability: capability.to_string(),
                sync_option,
                extras,
            })
            .await?
        {
            RequestReply::JobId(id) => Ok(id),
            other => Err(SyncError::System(format!("unexpected reply {other:?}"))),
        }
    }

    pub async fn remove_sync_job(
        &self,
        package_id: &str,
        sync_job_id: i32,
    ) -> Result<(), SyncError> {
        self.request(RequestKind::RemoveJob {
            package_id: package_id.to_string(),
            sync_job_id,
        })
        .await
        .map(|_| ())
    }

    pub async fn get_all_sync_jobs(&self, package_id: &str) -> Result<Vec<JobSummary>, SyncError> {
        match self
            .request(RequestKind::GetAllJobs {
                package_id: package_id.to_string(),
            })
            .await?
        {
            RequestReply::Jobs(jobs) => Ok(jobs),
            other => Err(SyncError::System(format!("unexpected reply {other:?}"))),
        }
    }

    pub async fn set_sync_status(&self, enabled: bool) -> Result<(), SyncError> {
        self.request(RequestKind::SetSyncEnabled { enabled })
            .await
            .map(|_| ())
    }

    /// Adapter-side result delivery.
    pub async fn send_result(
        &self,
        package_id: &str,
        job_name: &str,
        status: SyncStatus,
    ) -> Result<(), SyncError> {
        self.request(RequestKind::SendResult {
            package_id: package_id.to_string(),
            job_name: job_name.to_string(),
            status,
        })
        .await
        .map(|_| ())
    }

    // Device signal producers. Fire-and-forget: producers only enqueue.

    pub fn wifi_changed(&self, connected: bool) {
        self.send(Message::ConstraintChanged(ConstraintEvent::Wifi(connected)));
    }

    pub fn cellular_changed(&self, connected: bool) {
        self.send(Message::ConstraintChanged(ConstraintEvent::Cellular(
            connected,
        )));
    }

    pub fn storage_changed(&self, level: StorageLevel) {
        self.send(Message::ConstraintChanged(ConstraintEvent::Storage(level)));
    }

    pub fn ups_mode_changed(&self, enabled: bool) {
        self.send(Message::ConstraintChanged(ConstraintEvent::UpsMode(
            enabled,
        )));
    }

    pub fn data_changed(&self, capability: &str) {
        self.send(Message::DataChanged(capability.to_string()));
    }

    pub fn media_changed(&self, media_type: MediaType) {
        self.send(Message::DataChanged(media_type.capability().to_string()));
    }

    pub fn package_uninstalled(&self, package_id: &str) {
        self.send(Message::PackageUninstalled(package_id.to_string()));
    }

    pub fn check_alarm(&self) {
        self.send(Message::CheckAlarm);
    }
}

/// A running scheduler: the worker task plus the handles needed to talk to
/// it and to inspect persisted state.
pub struct Scheduler {
    handle: SchedulerHandle,
    repo: Arc<RepositoryEngine>,
    worker: JoinHandle<()>,
}

impl Scheduler {
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn repository(&self) -> Arc<RepositoryEngine> {
        self.repo.clone()
    }

    /// Ask the worker to flush state and stop, then wait for it.
    pub async fn shutdown(self) {
        self.handle.send(Message::Shutdown);
        let _ = self.worker.await;
    }
}

/// Load persisted state and spawn the dispatcher worker. Must run inside a
/// tokio runtime.
pub fn start(
    config: Arc<AppConfig>,
    accounts: Arc<dyn AccountSource>,
    link: Arc<dyn AdapterLink>,
) -> io::Result<Scheduler> {
    let (repo, pending, adapters) = RepositoryEngine::open(config.data_dir.clone())?;
    let repo = Arc::new(repo);

    let (tx, rx) = mpsc::unbounded_channel();
    let worker = SchedulerWorker::new(
        config,
        Clock::new(),
        repo.clone(),
        accounts,
        link,
        adapters,
        pending,
        tx.clone(),
    );
    let worker = tokio::spawn(worker.run(rx));
    info!("Sync scheduler started");

    Ok(Scheduler {
        handle: SchedulerHandle::new(tx),
        repo,
        worker,
    })
}
