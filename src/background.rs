//! 后台任务：定期回收已退出的监控进程。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::CHILD_REAP_INTERVAL_SECS;
use crate::supervisor::MonitorSession;

/// 启动后台任务（监控进程回收）。
pub fn spawn_background_tasks(session: Arc<MonitorSession>) -> JoinHandle<()> {
    spawn_reaper(session, Duration::from_secs(CHILD_REAP_INTERVAL_SECS))
}

fn spawn_reaper(session: Arc<MonitorSession>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            // is_running 顺带回收僵尸进程
            session.is_running().await;
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::supervisor::MonitorCommand;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reaper_keeps_running_after_child_exits() {
        let temp = tempdir().expect("tempdir");
        let session = Arc::new(MonitorSession::new(
            MonitorCommand::new("sh", ["-c", "exit 0"]),
            temp.path().join("monitor.log"),
            Duration::from_secs(1),
        ));
        session.start().await.expect("start");

        let reaper = spawn_reaper(session.clone(), Duration::from_millis(20));
        for _ in 0..50 {
            if !session.is_running().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!session.is_running().await);
        assert!(!reaper.is_finished());
        reaper.abort();
    }
}
