//! 临时文件写入后原子替换目标文件。

use std::io;
use std::path::Path;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// 将内容写入同目录临时文件，同步后重命名为目标文件。
pub async fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = target
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target path"))?;
    fs::create_dir_all(parent).await?;
    let base = target
        .file_name()
        .map(|name| name.to_string_lossy())
        .unwrap_or_else(|| "file".into());
    let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));

    let written: io::Result<()> = async {
        let mut file = File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await
    }
    .await;
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    let _ = sync_dir(parent).await;
    Ok(())
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::write_atomic;
    use tempfile::tempdir;

    #[tokio::test]
    async fn replaces_existing_file_without_leftovers() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("state.json");
        std::fs::write(&target, b"old").expect("seed");

        write_atomic(&target, b"new").await.expect("write");

        assert_eq!(std::fs::read(&target).expect("read"), b"new");
        let entries = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(entries, 1, "temp file should be renamed away");
    }
}
