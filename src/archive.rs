//! 将一轮下载的 rlog 打包为 gzip 压缩的 tar 归档。

use chrono::NaiveDateTime;
use flate2::{Compression, write::GzEncoder};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use tar::Builder;
use tracing::{info, warn};

pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// 已下载到暂存目录的文件及其在归档内的路径。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedFile {
    pub route: String,
    pub local_path: PathBuf,
    pub entry_name: String,
}

/// `{id}-rlogs-{YYYYmmdd-HHMMSS}.tar.gz`，设备 ID 中的非常规字符替换为 `_`。
pub fn archive_name(device_id: &str, timestamp: NaiveDateTime) -> String {
    format!(
        "{}-rlogs-{}.{ARCHIVE_EXTENSION}",
        sanitize_component(device_id),
        timestamp.format("%Y%m%d-%H%M%S")
    )
}

/// 设备 ID 来自远端，不能含路径分隔符。
fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// 在 `output_dir` 中写入归档，落盘完成后删除 `staging_dir`。
pub fn create_archive(
    files: &[StagedFile],
    device_id: &str,
    timestamp: NaiveDateTime,
    output_dir: &Path,
    staging_dir: &Path,
) -> io::Result<PathBuf> {
    fs::create_dir_all(output_dir)?;
    let name = archive_name(device_id, timestamp);
    let target = output_dir.join(&name);
    let partial = output_dir.join(format!("{name}.partial"));
    info!(archive = %target.display(), files = files.len(), "creating archive");

    if let Err(err) = write_tar_gz(files, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(err);
    }
    fs::rename(&partial, &target)?;

    if let Err(err) = fs::remove_dir_all(staging_dir)
        && err.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %staging_dir.display(), error = %err, "failed to remove staging dir");
    }

    let size = fs::metadata(&target)?.len();
    info!(
        archive = %target.display(),
        size_mb = %format!("{:.2}", size as f64 / (1024.0 * 1024.0)),
        "archive created"
    );
    Ok(target)
}

fn write_tar_gz(files: &[StagedFile], path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = Builder::new(encoder);
    for (index, staged) in files.iter().enumerate() {
        info!("[{}/{}] adding {}", index + 1, files.len(), staged.entry_name);
        let mut source = File::open(&staged.local_path)?;
        builder.append_file(&staged.entry_name, &mut source)?;
    }
    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tempfile::tempdir;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 17)
            .and_then(|date| date.and_hms_opt(h, m, s))
            .expect("valid timestamp")
    }

    fn stage(staging: &Path, route: &str, contents: &[u8]) -> StagedFile {
        let dir = staging.join(route);
        fs::create_dir_all(&dir).expect("create route dir");
        let local_path = dir.join("rlog.zst");
        fs::write(&local_path, contents).expect("write payload");
        StagedFile {
            route: route.to_string(),
            local_path,
            entry_name: format!("{route}/rlog.zst"),
        }
    }

    #[test]
    fn name_is_deterministic() {
        assert_eq!(
            archive_name("abc123", at(8, 5, 9)),
            "abc123-rlogs-20240517-080509.tar.gz"
        );
        assert_eq!(
            archive_name("abc123", at(8, 5, 9)),
            archive_name("abc123", at(8, 5, 9))
        );
        assert_ne!(
            archive_name("abc123", at(8, 5, 9)),
            archive_name("abc123", at(8, 5, 10))
        );
    }

    #[test]
    fn hostile_device_id_stays_inside_output_dir() {
        assert_eq!(
            archive_name("../../etc/x", at(8, 5, 9)),
            ".._.._etc_x-rlogs-20240517-080509.tar.gz"
        );
        assert_eq!(
            archive_name("a\\b c", at(8, 5, 9)),
            "a_b_c-rlogs-20240517-080509.tar.gz"
        );

        let temp = tempdir().expect("tempdir");
        let output = temp.path().join("out");
        let staging = temp.path().join("staging");
        let files = vec![stage(&staging, "route1", b"payload")];
        let archive = create_archive(&files, "../escape", at(9, 0, 0), &output, &staging)
            .expect("create archive");

        assert_eq!(archive.parent(), Some(output.as_path()));
        assert!(!temp.path().join("escape-rlogs-20240517-090000.tar.gz").exists());
    }

    #[test]
    fn archive_holds_entries_and_staging_is_removed() {
        let temp = tempdir().expect("tempdir");
        let staging = temp.path().join("staging");
        let files = vec![
            stage(&staging, "route1", b"first payload"),
            stage(&staging, "route2", b"second payload"),
        ];

        let archive = create_archive(&files, "dongle", at(12, 0, 0), temp.path(), &staging)
            .expect("create archive");

        assert!(archive.exists());
        assert!(!staging.exists());
        assert!(!temp.path().join("dongle-rlogs-20240517-120000.tar.gz.partial").exists());

        let mut entries = Vec::new();
        let mut reader = tar::Archive::new(GzDecoder::new(File::open(&archive).expect("open")));
        for entry in reader.entries().expect("entries") {
            let mut entry = entry.expect("entry");
            let name = entry.path().expect("path").to_string_lossy().to_string();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).expect("read entry");
            entries.push((name, body));
        }
        assert_eq!(
            entries,
            vec![
                ("route1/rlog.zst".to_string(), b"first payload".to_vec()),
                ("route2/rlog.zst".to_string(), b"second payload".to_vec()),
            ]
        );
    }

    #[test]
    fn failed_write_keeps_staging() {
        let temp = tempdir().expect("tempdir");
        let staging = temp.path().join("staging");
        let mut missing = stage(&staging, "route1", b"data");
        missing.local_path = staging.join("route1").join("gone.zst");

        let result = create_archive(&[missing], "dongle", at(1, 2, 3), temp.path(), &staging);

        assert!(result.is_err());
        assert!(staging.join("route1").join("rlog.zst").exists());
        assert!(!temp.path().join("dongle-rlogs-20240517-010203.tar.gz").exists());
    }
}
