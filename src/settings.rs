//! 可在控制面板中编辑的设置，保存为数据目录下的 `config.json`。

use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind};
use std::path::Path;
use tokio::fs;
use tracing::warn;

use crate::atomic::write_atomic;
use crate::config::{DEFAULT_DEVICE_HOST, DEFAULT_DEVICE_PORT, DEFAULT_DEVICE_USER};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub device_host: String,
    pub device_user: String,
    pub device_port: u16,
    pub identity_file: Option<String>,
    pub base_url: String,
    pub upload_path: String,
    pub username: String,
    pub password: String,
    pub accept_invalid_certs: bool,
    pub delete_archive_after_upload: bool,
    pub auto_start: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            device_host: DEFAULT_DEVICE_HOST.to_string(),
            device_user: DEFAULT_DEVICE_USER.to_string(),
            device_port: DEFAULT_DEVICE_PORT,
            identity_file: None,
            base_url: String::new(),
            upload_path: "/".to_string(),
            username: String::new(),
            password: String::new(),
            accept_invalid_certs: true,
            delete_archive_after_upload: false,
            auto_start: false,
        }
    }
}

impl Settings {
    /// 读取设置；文件缺失或无法读取时使用默认值。
    pub async fn load(path: &Path) -> Settings {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Settings::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read settings, using defaults");
                return Settings::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(settings) => settings,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to parse settings, using defaults");
                Settings::default()
            }
        }
    }

    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let contents = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        write_atomic(path, &contents).await
    }

    /// 返回第一个无效字段的说明。
    pub fn validate(&self) -> Result<(), String> {
        if self.device_host.trim().is_empty() {
            return Err("device host is required".into());
        }
        if self.device_user.trim().is_empty() {
            return Err("device user is required".into());
        }
        if self.device_port == 0 {
            return Err("device port must be non-zero".into());
        }
        let base = self.base_url.trim();
        if !base.is_empty() && !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err("server url must start with http:// or https://".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_and_corrupt_files_yield_defaults() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        assert_eq!(Settings::load(&path).await, Settings::default());

        std::fs::write(&path, b"[oops").expect("seed");
        assert_eq!(Settings::load(&path).await, Settings::default());
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults_for_missing_keys() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        std::fs::write(&path, br#"{"deviceHost":"10.0.0.7","autoStart":true}"#).expect("seed");

        let settings = Settings::load(&path).await;
        assert_eq!(settings.device_host, "10.0.0.7");
        assert!(settings.auto_start);
        assert_eq!(settings.device_user, Settings::default().device_user);
    }

    #[tokio::test]
    async fn save_then_load() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("config.json");
        let settings = Settings {
            base_url: "https://files.example:4443".into(),
            username: "nnlc".into(),
            ..Settings::default()
        };
        settings.save(&path).await.expect("save");
        assert_eq!(Settings::load(&path).await, settings);
    }

    #[test]
    fn validate_rejects_bad_fields() {
        assert!(Settings::default().validate().is_ok());
        let no_host = Settings {
            device_host: " ".into(),
            ..Settings::default()
        };
        assert!(no_host.validate().is_err());
        let bad_url = Settings {
            base_url: "ftp://x".into(),
            ..Settings::default()
        };
        assert!(bad_url.validate().is_err());
    }
}
