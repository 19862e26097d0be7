//! 通过 SSH/SFTP 访问设备。

use ssh2::{ErrorCode, Session, Sftp};
use std::fs::File;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::config::{
    DEVICE_ID_PATH, DEVICE_ROUTES_DIR, PAYLOAD_FILE_NAME, SSH_CONNECT_TIMEOUT_SECS,
    SSH_PROBE_TIMEOUT_SECS, SSH_SESSION_TIMEOUT_SECS,
};
use crate::device::{Device, DeviceError, DeviceSession};
use crate::settings::Settings;

// libssh2 错误码
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

impl From<ssh2::Error> for DeviceError {
    fn from(err: ssh2::Error) -> Self {
        match err.code() {
            ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => DeviceError::NotFound,
            ErrorCode::Session(
                LIBSSH2_ERROR_SOCKET_SEND
                | LIBSSH2_ERROR_TIMEOUT
                | LIBSSH2_ERROR_SOCKET_DISCONNECT
                | LIBSSH2_ERROR_SOCKET_RECV,
            ) => DeviceError::ConnectionLost(err.to_string()),
            _ => DeviceError::from_message(err.to_string()),
        }
    }
}

/// 设备上的远端路径。
#[derive(Clone, Debug)]
pub struct DeviceLayout {
    pub routes_dir: String,
    pub identifier_path: String,
    pub payload_name: String,
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self {
            routes_dir: DEVICE_ROUTES_DIR.to_string(),
            identifier_path: DEVICE_ID_PATH.to_string(),
            payload_name: PAYLOAD_FILE_NAME.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SshDevice {
    host: String,
    port: u16,
    user: String,
    identity_file: Option<PathBuf>,
    layout: DeviceLayout,
}

impl SshDevice {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            host: settings.device_host.clone(),
            port: settings.device_port,
            user: settings.device_user.clone(),
            identity_file: settings.identity_file.as_ref().map(PathBuf::from),
            layout: DeviceLayout::default(),
        }
    }

    fn resolve(&self) -> io::Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "device address did not resolve"))
    }

    fn authenticate(&self, session: &Session) -> Result<(), DeviceError> {
        let mut auth_errs: Vec<String> = Vec::new();
        if let Err(err) = session.userauth_agent(&self.user) {
            auth_errs.push(format!("agent: {err}"));
        }

        let mut candidates: Vec<PathBuf> = self.identity_file.iter().cloned().collect();
        if let Some(home) = dirs::home_dir() {
            for name in ["id_ed25519", "id_rsa", "id_ecdsa"] {
                candidates.push(home.join(".ssh").join(name));
            }
        }
        for key in candidates {
            if session.authenticated() {
                break;
            }
            if !key.exists() {
                continue;
            }
            if let Err(err) = session.userauth_pubkey_file(&self.user, None, &key, None) {
                auth_errs.push(format!("{}: {err}", key.display()));
            }
        }

        if session.authenticated() {
            Ok(())
        } else {
            debug!("ssh auth attempts failed: {}", auth_errs.join("; "));
            Err(DeviceError::Other(format!(
                "ssh authentication failed: {}",
                auth_errs.join("; ")
            )))
        }
    }
}

impl Device for SshDevice {
    type Session = SshSession;

    fn is_reachable(&self) -> bool {
        let Ok(addr) = self.resolve() else {
            return false;
        };
        TcpStream::connect_timeout(&addr, Duration::from_secs(SSH_PROBE_TIMEOUT_SECS)).is_ok()
    }

    fn connect(&self) -> Result<SshSession, DeviceError> {
        let addr = self.resolve()?;
        let tcp = TcpStream::connect_timeout(&addr, Duration::from_secs(SSH_CONNECT_TIMEOUT_SECS))?;
        let io_timeout = Some(Duration::from_secs(SSH_SESSION_TIMEOUT_SECS));
        tcp.set_read_timeout(io_timeout)?;
        tcp.set_write_timeout(io_timeout)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout((SSH_SESSION_TIMEOUT_SECS * 1000) as u32);
        session.handshake()?;
        self.authenticate(&session)?;
        let sftp = session.sftp()?;
        Ok(SshSession {
            session,
            sftp,
            layout: self.layout.clone(),
        })
    }
}

pub struct SshSession {
    session: Session,
    sftp: Sftp,
    layout: DeviceLayout,
}

impl SshSession {
    fn route_path(&self, route: &str) -> PathBuf {
        Path::new(&self.layout.routes_dir).join(route)
    }
}

impl DeviceSession for SshSession {
    fn identifier(&mut self) -> Result<String, DeviceError> {
        let mut file = self.sftp.open(Path::new(&self.layout.identifier_path))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        Ok(contents.trim().to_string())
    }

    fn list_routes(&mut self) -> Result<Vec<String>, DeviceError> {
        let entries = self.sftp.readdir(Path::new(&self.layout.routes_dir))?;
        let mut routes: Vec<String> = entries
            .into_iter()
            .filter(|(_, stat)| stat.is_dir())
            .filter_map(|(path, _)| {
                path.file_name()
                    .map(|name| name.to_string_lossy().to_string())
            })
            .filter(|name| name != "." && name != "..")
            .collect();
        routes.sort();
        Ok(routes)
    }

    fn has_payload(&mut self, route: &str) -> Result<bool, DeviceError> {
        let remote = self.route_path(route).join(&self.layout.payload_name);
        match self.sftp.stat(&remote) {
            Ok(stat) => Ok(stat.is_file()),
            Err(err) => match DeviceError::from(err) {
                DeviceError::NotFound => Ok(false),
                other => Err(other),
            },
        }
    }

    fn fetch_payload(&mut self, route: &str, dest: &Path) -> Result<(), DeviceError> {
        let remote = self.route_path(route).join(&self.layout.payload_name);
        let mut source = self.sftp.open(&remote)?;
        let mut target = File::create(dest)?;
        io::copy(&mut source, &mut target)?;
        target.sync_all()?;
        Ok(())
    }

    fn close(self) {
        let SshSession { session, sftp, .. } = self;
        drop(sftp);
        let _ = session.disconnect(None, "rlog-relay done", None);
    }
}
