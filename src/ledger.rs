//! 已上传路线名的持久化集合。
//!
//! 以格式化的 JSON 字符串数组存储。文件不存在视为空集合；无法解析的文件返回
//! [`LedgerError::Corrupt`]，且不会被静默覆盖。

use std::collections::BTreeSet;
use std::fmt;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::atomic::write_atomic;

#[derive(Debug)]
pub enum LedgerError {
    Io(io::Error),
    Corrupt(serde_json::Error),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Io(err) => write!(f, "ledger io error: {err}"),
            LedgerError::Corrupt(err) => write!(f, "ledger file is corrupt: {err}"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Io(err) => Some(err),
            LedgerError::Corrupt(err) => Some(err),
        }
    }
}

impl From<io::Error> for LedgerError {
    fn from(err: io::Error) -> Self {
        LedgerError::Io(err)
    }
}

#[derive(Clone, Debug)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<BTreeSet<String>, LedgerError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(LedgerError::Io(err)),
        };
        let routes: Vec<String> = serde_json::from_slice(&bytes).map_err(LedgerError::Corrupt)?;
        Ok(routes.into_iter().collect())
    }

    pub async fn save(&self, routes: &BTreeSet<String>) -> Result<(), LedgerError> {
        let contents = serde_json::to_vec_pretty(routes).map_err(LedgerError::Corrupt)?;
        write_atomic(&self.path, &contents).await?;
        Ok(())
    }

    /// 将 `routes` 合并进持久化集合并返回合并后的集合。
    pub async fn record<I>(&self, routes: I) -> Result<BTreeSet<String>, LedgerError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut current = self.load().await?;
        current.extend(routes);
        self.save(&current).await?;
        Ok(current)
    }

    pub async fn count(&self) -> Result<usize, LedgerError> {
        Ok(self.load().await?.len())
    }

    pub async fn clear(&self) -> Result<(), LedgerError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LedgerError::Io(err)),
        }
    }
}
