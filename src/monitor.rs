//! 监控循环：等待设备上线，下载新的 rlog，打包、上传，记录已上传路线，
//! 等待设备离线，然后重复。
//!
//! 只有上传服务确认收到归档后才写入上传记录；失败的归档保留在数据目录中。

use chrono::Local;
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::archive::create_archive;
use crate::config::{
    DEFAULT_AUTH_BACKOFF_SECS, DEFAULT_CONNECT_BACKOFF_SECS, DEFAULT_ERROR_BACKOFF_SECS,
    DEFAULT_POLL_SECS,
};
use crate::device::{Device, SessionHarvest, harvest_new_payloads};
use crate::ledger::{Ledger, LedgerError};
use crate::storage::Storage;
use crate::upload::ArchiveUploader;

#[derive(Clone, Copy, Debug)]
pub struct MonitorTimings {
    pub poll_interval: Duration,
    pub connect_backoff: Duration,
    pub auth_backoff: Duration,
    pub error_backoff: Duration,
}

impl Default for MonitorTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            connect_backoff: Duration::from_secs(DEFAULT_CONNECT_BACKOFF_SECS),
            auth_backoff: Duration::from_secs(DEFAULT_AUTH_BACKOFF_SECS),
            error_backoff: Duration::from_secs(DEFAULT_ERROR_BACKOFF_SECS),
        }
    }
}

#[derive(Debug)]
pub enum MonitorError {
    Ledger(LedgerError),
    Io(io::Error),
    Task(JoinError),
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::Ledger(err) => write!(f, "{err}"),
            MonitorError::Io(err) => write!(f, "io error: {err}"),
            MonitorError::Task(err) => write!(f, "blocking task failed: {err}"),
        }
    }
}

impl std::error::Error for MonitorError {}

impl MonitorError {
    /// 只有上传记录损坏会终止循环。
    pub fn is_fatal(&self) -> bool {
        matches!(self, MonitorError::Ledger(LedgerError::Corrupt(_)))
    }
}

impl From<LedgerError> for MonitorError {
    fn from(err: LedgerError) -> Self {
        MonitorError::Ledger(err)
    }
}

impl From<io::Error> for MonitorError {
    fn from(err: io::Error) -> Self {
        MonitorError::Io(err)
    }
}

impl From<JoinError> for MonitorError {
    fn from(err: JoinError) -> Self {
        MonitorError::Task(err)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    ConnectFailed,
    NothingNew,
    AuthFailed { archive: PathBuf },
    UploadFailed { archive: PathBuf },
    /// `total`：循环中为写入后上传记录的路线总数；单次提取时等于 `routes`。
    Uploaded { url: String, routes: usize, total: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Presence {
    Reachable,
    Unreachable,
}

pub struct Monitor<D, U> {
    device: Arc<D>,
    uploader: U,
    ledger: Ledger,
    storage: Storage,
    timings: MonitorTimings,
    delete_after_upload: bool,
}

impl<D: Device, U: ArchiveUploader> Monitor<D, U> {
    pub fn new(device: D, uploader: U, storage: Storage, timings: MonitorTimings) -> Self {
        Self {
            device: Arc::new(device),
            uploader,
            ledger: Ledger::new(storage.ledger_path()),
            storage,
            timings,
            delete_after_upload: false,
        }
    }

    pub fn delete_archive_after_upload(mut self, enabled: bool) -> Self {
        self.delete_after_upload = enabled;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// 持续运行，直到上传记录文件损坏；其余错误记录日志并在退避后重试。
    pub async fn run(&self) -> Result<(), MonitorError> {
        loop {
            let result = match self.run_cycle().await {
                Ok(outcome) => self.settle(&outcome).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(error = %err, "cycle failed");
                    sleep(self.timings.error_backoff).await;
                }
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleOutcome, MonitorError> {
        self.wait_for(Presence::Reachable).await?;

        let uploaded = self.ledger.load().await?;
        let Some(harvest) = self.harvest(uploaded).await? else {
            return Ok(CycleOutcome::ConnectFailed);
        };
        if harvest.fetched.is_empty() {
            info!("no new rlogs to upload");
            return Ok(CycleOutcome::NothingNew);
        }

        let (url, routes) = match self.deliver(&harvest).await? {
            CycleOutcome::Uploaded { url, routes, .. } => (url, routes),
            other => return Ok(other),
        };
        let total = self.ledger.record(harvest.routes()).await?.len();
        info!(routes, total, "marked routes as uploaded");
        Ok(CycleOutcome::Uploaded { url, routes, total })
    }

    /// 单次提取：立即连接设备，下载全部路线并上传，不读取也不写入上传记录。
    pub async fn extract_once(&self) -> Result<CycleOutcome, MonitorError> {
        let Some(harvest) = self.harvest(BTreeSet::new()).await? else {
            return Ok(CycleOutcome::ConnectFailed);
        };
        if harvest.fetched.is_empty() {
            warn!("no rlogs found on device");
            return Ok(CycleOutcome::NothingNew);
        }
        self.deliver(&harvest).await
    }

    /// 连接失败时返回 `None`。
    async fn harvest(
        &self,
        uploaded: BTreeSet<String>,
    ) -> Result<Option<SessionHarvest>, MonitorError> {
        info!("connecting to device");
        let device = self.device.clone();
        let staging = self.storage.staging_dir();
        let harvest = tokio::task::spawn_blocking(move || {
            harvest_new_payloads(device.as_ref(), &uploaded, &staging)
        })
        .await?;
        let harvest = match harvest {
            Ok(harvest) => harvest,
            Err(err) => {
                error!(error = %err, "failed to connect to device");
                return Ok(None);
            }
        };

        if harvest.interrupted {
            warn!(
                fetched = harvest.fetched.len(),
                "device connection lost, continuing with what was fetched"
            );
        }
        if !harvest.fetched.is_empty() {
            info!(count = harvest.fetched.len(), "downloaded new rlog files");
        }
        Ok(Some(harvest))
    }

    /// 打包、登录并上传。成功时 `total` 为本次路线数，由调用方决定是否写入上传记录。
    async fn deliver(&self, harvest: &SessionHarvest) -> Result<CycleOutcome, MonitorError> {
        let archive = self.archive(harvest).await?;

        let token = match self.uploader.authenticate().await {
            Ok(token) => token,
            Err(err) => {
                error!(error = %err, archive = %archive.display(), "login failed, archive kept locally");
                return Ok(CycleOutcome::AuthFailed { archive });
            }
        };

        let url = match self.uploader.upload(&token, &archive).await {
            Ok(url) => url,
            Err(err) => {
                error!(error = %err, archive = %archive.display(), "upload failed, archive kept locally");
                return Ok(CycleOutcome::UploadFailed { archive });
            }
        };
        info!(%url, "upload complete");

        if self.delete_after_upload
            && let Err(err) = tokio::fs::remove_file(&archive).await
        {
            warn!(archive = %archive.display(), error = %err, "failed to delete uploaded archive");
        }

        let routes = harvest.fetched.len();
        Ok(CycleOutcome::Uploaded {
            url,
            routes,
            total: routes,
        })
    }

    async fn archive(&self, harvest: &SessionHarvest) -> Result<PathBuf, MonitorError> {
        let files = harvest.fetched.clone();
        let device_id = harvest.device_id.clone();
        let output_dir = self.storage.archive_dir().to_path_buf();
        let staging = self.storage.staging_dir();
        let timestamp = Local::now().naive_local();
        let archive = tokio::task::spawn_blocking(move || {
            create_archive(&files, &device_id, timestamp, &output_dir, &staging)
        })
        .await??;
        Ok(archive)
    }

    async fn settle(&self, outcome: &CycleOutcome) -> Result<(), MonitorError> {
        match outcome {
            CycleOutcome::ConnectFailed => {
                sleep(self.timings.connect_backoff).await;
                Ok(())
            }
            CycleOutcome::AuthFailed { .. } => {
                sleep(self.timings.auth_backoff).await;
                Ok(())
            }
            CycleOutcome::NothingNew
            | CycleOutcome::UploadFailed { .. }
            | CycleOutcome::Uploaded { .. } => {
                info!("waiting for device to leave");
                self.wait_for(Presence::Unreachable).await?;
                info!("device disconnected");
                Ok(())
            }
        }
    }

    async fn wait_for(&self, presence: Presence) -> Result<(), MonitorError> {
        let want = presence == Presence::Reachable;
        let mut announced = false;
        loop {
            let device = self.device.clone();
            let reachable = tokio::task::spawn_blocking(move || device.is_reachable()).await?;
            if reachable == want {
                if announced && want {
                    info!("device is online");
                }
                return Ok(());
            }
            if !announced && want {
                info!("waiting for device");
            }
            announced = true;
            sleep(self.timings.poll_interval).await;
        }
    }
}
