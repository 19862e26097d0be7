//! 控制面板 API：监控启停与状态、实时日志流、上传记录与设置。

use axum::extract::{Extension, Json};
use axum::response::Json as JsonResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{LOG_POLL_INTERVAL_MS, LOG_REPLAY_LINES};
use crate::error::ApiError;
use crate::ledger::Ledger;
use crate::logtail::LogTail;
use crate::settings::Settings;
use crate::storage::Storage;
use crate::supervisor::{MonitorSession, StartOutcome};

pub const STREAM_DONE: &str = "[DONE]";
pub const STREAM_ERROR: &str = "[ERROR]";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SuccessResponse {
    success: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StartResponse {
    started: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusResponse {
    running: bool,
    log_exists: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CountResponse {
    count: usize,
}

/// 按需启动监控，并以 SSE 推送其日志。
pub async fn run_monitor(
    Extension(session): Extension<Arc<MonitorSession>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<String>(256);
    tokio::spawn(stream_monitor(session, tx));

    let stream = stream::unfold(rx, |mut rx| async move {
        let line = rx.recv().await?;
        let event = Event::default().data(line.replace('\r', ""));
        Some((Ok(event), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn stream_monitor(session: Arc<MonitorSession>, tx: mpsc::Sender<String>) {
    if let Err(err) = relay_monitor_output(&session, &tx).await {
        warn!(error = %err, "monitor log stream failed");
        let _ = tx.send(format!("ERROR: {err}")).await;
        let _ = tx.send(STREAM_ERROR.to_string()).await;
    }
}

async fn relay_monitor_output(
    session: &MonitorSession,
    tx: &mpsc::Sender<String>,
) -> io::Result<()> {
    let log_path = session.log_path();
    let mut tail = match session.start().await? {
        StartOutcome::Started => {
            let _ = tx.send("Starting rlog auto-uploader...".to_string()).await;
            LogTail::from_start(log_path).await?
        }
        StartOutcome::AlreadyRunning => {
            let _ = tx
                .send("✓ Monitoring is already running (reconnecting to logs...)".to_string())
                .await;
            let (replayed, tail) = LogTail::replay(log_path, LOG_REPLAY_LINES).await?;
            for line in replayed {
                let _ = tx.send(line).await;
            }
            tail
        }
    };

    while session.is_running().await {
        if tx.is_closed() {
            info!("log stream client disconnected");
            return Ok(());
        }
        let lines = tail.read_lines().await?;
        if lines.is_empty() {
            tokio::time::sleep(Duration::from_millis(LOG_POLL_INTERVAL_MS)).await;
            continue;
        }
        for line in lines {
            let _ = tx.send(line).await;
        }
    }

    for line in tail.finish().await? {
        let _ = tx.send(line).await;
    }
    let _ = tx.send(STREAM_DONE.to_string()).await;
    Ok(())
}

/// 仅启动监控，不附加日志输出。
pub async fn start_monitor(
    Extension(session): Extension<Arc<MonitorSession>>,
) -> Result<JsonResponse<StartResponse>, ApiError> {
    let outcome = session.start().await?;
    Ok(JsonResponse(StartResponse {
        started: outcome == StartOutcome::Started,
    }))
}

pub async fn stop_monitor(
    Extension(session): Extension<Arc<MonitorSession>>,
) -> Result<JsonResponse<SuccessResponse>, ApiError> {
    session.stop().await?;
    Ok(JsonResponse(SuccessResponse { success: true }))
}

pub async fn monitor_status(
    Extension(session): Extension<Arc<MonitorSession>>,
) -> JsonResponse<StatusResponse> {
    let running = session.is_running().await;
    let log_exists = tokio::fs::try_exists(session.log_path())
        .await
        .unwrap_or(false);
    JsonResponse(StatusResponse {
        running,
        log_exists,
    })
}

pub async fn upload_count(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<CountResponse>, ApiError> {
    let count = Ledger::new(storage.ledger_path()).count().await?;
    Ok(JsonResponse(CountResponse { count }))
}

pub async fn clear_history(
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<SuccessResponse>, ApiError> {
    Ledger::new(storage.ledger_path()).clear().await?;
    info!("upload history cleared");
    Ok(JsonResponse(SuccessResponse { success: true }))
}

pub async fn get_settings(
    Extension(storage): Extension<Arc<Storage>>,
) -> JsonResponse<Settings> {
    JsonResponse(Settings::load(&storage.settings_path()).await)
}

/// 保存设置；正在运行的监控在下次启动时生效。
pub async fn save_settings(
    Extension(storage): Extension<Arc<Storage>>,
    Json(settings): Json<Settings>,
) -> Result<JsonResponse<SuccessResponse>, ApiError> {
    settings.validate().map_err(ApiError::BadRequest)?;
    settings.save(&storage.settings_path()).await?;
    info!(device_host = %settings.device_host, "settings saved");
    Ok(JsonResponse(SuccessResponse { success: true }))
}
