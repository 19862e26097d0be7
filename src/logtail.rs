//! 监控日志的增量读取。
//!
//! 跟随读取时只返回完整的行；末尾片段等到换行或 [`LogTail::finish`] 时再输出。

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

pub struct LogTail {
    reader: BufReader<File>,
    pending: Vec<u8>,
}

impl LogTail {
    /// 从文件开头开始跟随。
    pub async fn from_start(path: &Path) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self {
            reader: BufReader::new(file),
            pending: Vec::new(),
        })
    }

    /// 返回最后 `count` 行完整日志，以及定位在其后的 tail；内存占用只与 `count` 相关。
    pub async fn replay(path: &Path, count: usize) -> io::Result<(Vec<String>, Self)> {
        let file = File::open(path).await?;
        let mut reader = BufReader::new(file);
        let mut recent = VecDeque::with_capacity(count);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            if line.last() != Some(&b'\n') {
                // 末尾尚未换行的片段，交给后续读取
                break;
            }
            line.pop();
            if count == 0 {
                continue;
            }
            if recent.len() == count {
                recent.pop_front();
            }
            recent.push_back(decode_line(&line));
        }
        Ok((recent.into(), Self {
            reader,
            pending: line,
        }))
    }

    /// 读取上次调用以来追加的所有完整行。
    pub async fn read_lines(&mut self) -> io::Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let read = self.reader.read_until(b'\n', &mut self.pending).await?;
            if read == 0 {
                break;
            }
            if self.pending.last() == Some(&b'\n') {
                self.pending.pop();
                lines.push(decode_line(&self.pending));
                self.pending.clear();
            }
        }
        Ok(lines)
    }

    /// 读出剩余内容，包括没有换行结尾的最后一行。
    pub async fn finish(mut self) -> io::Result<Vec<String>> {
        let mut lines = self.read_lines().await?;
        if !self.pending.is_empty() {
            lines.push(decode_line(&self.pending));
        }
        Ok(lines)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    text.trim_end_matches('\r').to_string()
}
