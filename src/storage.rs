//! 控制服务与监控进程共用的数据目录布局。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::{LEDGER_FILE_NAME, MONITOR_LOG_FILE_NAME, SETTINGS_FILE_NAME, STAGING_DIR_NAME};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE_NAME)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join(LEDGER_FILE_NAME)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(MONITOR_LOG_FILE_NAME)
    }

    /// 本轮下载的文件在打包前存放于此。
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR_NAME)
    }

    pub fn archive_dir(&self) -> &Path {
        &self.root
    }
}
