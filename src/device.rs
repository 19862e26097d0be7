//! 设备访问接口：可达性探测、会话生命周期、路线枚举与文件下载。
//!
//! 所有方法均为阻塞调用，监控循环在阻塞线程池中执行它们。

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::archive::StagedFile;
use crate::config::{PAYLOAD_FILE_NAME, UNKNOWN_DEVICE_ID};

/// 表示会话中途连接断开的错误文本片段。
const CONNECTION_LOST_MARKERS: &[&str] = &["not open", "closed", "connection", "broken pipe"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    NotFound,
    ConnectionLost(String),
    Other(String),
}

impl DeviceError {
    /// 根据错误消息归类传输错误。
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        if CONNECTION_LOST_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            DeviceError::ConnectionLost(message)
        } else {
            DeviceError::Other(message)
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DeviceError::ConnectionLost(_))
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotFound => write!(f, "no such file"),
            DeviceError::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            DeviceError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for DeviceError {}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => DeviceError::NotFound,
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof => DeviceError::ConnectionLost(err.to_string()),
            _ => DeviceError::from_message(err.to_string()),
        }
    }
}

pub trait Device: Send + Sync + 'static {
    type Session: DeviceSession;

    /// 有超时上限的探测。
    fn is_reachable(&self) -> bool;

    fn connect(&self) -> Result<Self::Session, DeviceError>;
}

pub trait DeviceSession: Send {
    fn identifier(&mut self) -> Result<String, DeviceError>;

    /// 按字典序返回路线名。
    fn list_routes(&mut self) -> Result<Vec<String>, DeviceError>;

    fn has_payload(&mut self, route: &str) -> Result<bool, DeviceError>;

    fn fetch_payload(&mut self, route: &str, dest: &Path) -> Result<(), DeviceError>;

    /// 尽力关闭，不报错。
    fn close(self);
}

/// 一次会话的下载结果。
#[derive(Debug, Default)]
pub struct SessionHarvest {
    pub device_id: String,
    pub fetched: Vec<StagedFile>,
    pub interrupted: bool,
}

impl SessionHarvest {
    pub fn routes(&self) -> Vec<String> {
        self.fetched.iter().map(|file| file.route.clone()).collect()
    }
}

/// 连接设备，下载 `uploaded` 之外所有路线的文件后关闭会话。
/// 连接中断时提前结束枚举，但保留已下载的文件。
pub fn harvest_new_payloads<D: Device>(
    device: &D,
    uploaded: &BTreeSet<String>,
    staging_dir: &Path,
) -> Result<SessionHarvest, DeviceError> {
    let mut session = device.connect()?;
    info!("connected to device");

    let device_id = match session.identifier() {
        Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
        Ok(_) => {
            warn!("device identifier is empty");
            UNKNOWN_DEVICE_ID.to_string()
        }
        Err(err) => {
            warn!(error = %err, "failed to read device identifier");
            UNKNOWN_DEVICE_ID.to_string()
        }
    };
    info!(device_id, "device identified");

    let mut harvest = SessionHarvest {
        device_id,
        ..SessionHarvest::default()
    };
    collect(&mut session, uploaded, staging_dir, &mut harvest);

    session.close();
    info!("device session closed");
    Ok(harvest)
}

fn collect<S: DeviceSession>(
    session: &mut S,
    uploaded: &BTreeSet<String>,
    staging_dir: &Path,
    harvest: &mut SessionHarvest,
) {
    info!("scanning for new rlogs");
    let mut routes = match session.list_routes() {
        Ok(routes) => routes,
        Err(err) => {
            warn!(error = %err, "failed to list routes");
            harvest.interrupted = err.is_connection_lost();
            return;
        }
    };
    routes.sort();
    let already = routes.iter().filter(|route| uploaded.contains(*route)).count();
    info!(
        total = routes.len(),
        already_uploaded = already,
        pending = routes.len() - already,
        "routes found"
    );

    for route in routes.iter().filter(|route| !uploaded.contains(*route)) {
        let present = match session.has_payload(route) {
            Ok(present) => present,
            Err(err) if err.is_connection_lost() => {
                lost_connection(harvest, &err);
                return;
            }
            Err(err) => {
                warn!(route, error = %err, "failed to check payload");
                continue;
            }
        };
        if !present {
            continue;
        }

        let dest = staged_path(staging_dir, route);
        info!("[NEW] downloading {route}/{PAYLOAD_FILE_NAME}");
        let fetched = dest
            .parent()
            .map(fs::create_dir_all)
            .transpose()
            .map_err(DeviceError::from)
            .and_then(|_| session.fetch_payload(route, &dest));
        match fetched {
            Ok(()) => harvest.fetched.push(StagedFile {
                route: route.clone(),
                local_path: dest,
                entry_name: format!("{route}/{PAYLOAD_FILE_NAME}"),
            }),
            Err(err) if err.is_connection_lost() => {
                let _ = fs::remove_file(&dest);
                lost_connection(harvest, &err);
                return;
            }
            Err(err) => {
                let _ = fs::remove_file(&dest);
                warn!(route, error = %err, "failed to download payload");
            }
        }
    }
}

fn lost_connection(harvest: &mut SessionHarvest, err: &DeviceError) {
    warn!(
        error = %err,
        fetched = harvest.fetched.len(),
        "connection lost during download, keeping fetched rlogs"
    );
    harvest.interrupted = true;
}

pub fn staged_path(staging_dir: &Path, route: &str) -> PathBuf {
    staging_dir.join(route).join(PAYLOAD_FILE_NAME)
}


#[cfg(test)]
mod tests {
    use super::fake::FakeDevice;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn classifies_connection_markers() {
        assert!(DeviceError::from_message("Socket is not open").is_connection_lost());
        assert!(DeviceError::from_message("Connection reset by peer").is_connection_lost());
        assert!(DeviceError::from_message("channel closed").is_connection_lost());
        assert!(!DeviceError::from_message("permission denied").is_connection_lost());
    }

    #[test]
    fn skips_ledgered_routes_and_missing_payloads() {
        let temp = tempdir().expect("tempdir");
        let staging = temp.path().join("staging");
        let device = FakeDevice::with_routes(&[
            ("2024-01-01--a", Some(b"a")),
            ("2024-01-02--b", None),
            ("2024-01-03--c", Some(b"c")),
        ]);
        let uploaded: BTreeSet<String> = ["2024-01-01--a".to_string()].into();

        let harvest = harvest_new_payloads(&device, &uploaded, &staging).expect("harvest");

        assert_eq!(harvest.device_id, "dongle42");
        assert_eq!(harvest.routes(), vec!["2024-01-03--c".to_string()]);
        assert_eq!(device.fetched(), vec!["2024-01-03--c".to_string()]);
        assert!(!harvest.interrupted);
        assert_eq!(
            fs::read(staged_path(&staging, "2024-01-03--c")).expect("staged"),
            b"c"
        );
        assert_eq!(device.state.lock().expect("state").closed, 1);
    }

    #[test]
    fn connection_loss_keeps_partial_progress() {
        let temp = tempdir().expect("tempdir");
        let device = FakeDevice::with_routes(&[
            ("r1", Some(b"1")),
            ("r2", Some(b"2")),
            ("r3", Some(b"3")),
        ]);
        device.state.lock().expect("state").drop_after = Some(1);

        let harvest =
            harvest_new_payloads(&device, &BTreeSet::new(), temp.path()).expect("harvest");

        assert!(harvest.interrupted);
        assert_eq!(harvest.routes(), vec!["r1".to_string()]);
    }

    #[test]
    fn unreadable_identifier_falls_back_to_unknown() {
        let temp = tempdir().expect("tempdir");
        let device = FakeDevice::with_routes(&[]);
        device.state.lock().expect("state").identifier = None;

        let harvest =
            harvest_new_payloads(&device, &BTreeSet::new(), temp.path()).expect("harvest");

        assert_eq!(harvest.device_id, UNKNOWN_DEVICE_ID);
        assert!(harvest.fetched.is_empty());
    }

    #[test]
    fn refused_connection_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let device = FakeDevice::with_routes(&[("r1", Some(b"1"))]);
        device.state.lock().expect("state").refuse_connect = true;

        let result = harvest_new_payloads(&device, &BTreeSet::new(), temp.path());
        assert!(result.is_err());
        assert!(device.fetched().is_empty());
    }
}
