//! rlog relay binary.
//!
//! `serve` runs the web control panel, which launches this same executable with
//! the `monitor` subcommand as a child process and streams its log. `monitor`
//! runs the device polling loop: harvest new rlogs over SSH, archive them,
//! upload the archive to FileBrowser and record the routes in the ledger.
//! `extract` is the one-shot variant: every route, no ledger, exit code reports
//! whether the archive reached the server.

mod archive;
mod atomic;
mod background;
mod config;
mod control;
mod device;
mod error;
mod frontend;
mod http;
mod ledger;
mod logging;
mod logtail;
mod monitor;
mod settings;
mod ssh;
mod storage;
mod supervisor;
mod upload;
mod version;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use crate::background::spawn_background_tasks;
use crate::config::{Args, Command, MonitorArgs, ServeArgs};
use crate::ledger::Ledger;
use crate::monitor::{CycleOutcome, Monitor, MonitorTimings};
use crate::settings::Settings;
use crate::ssh::SshDevice;
use crate::storage::Storage;
use crate::supervisor::{MonitorCommand, MonitorSession};
use crate::upload::FileBrowserClient;

shadow!(build);

#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    match args.command {
        Command::Serve(serve) => run_server(args.data_dir, serve).await,
        Command::Monitor(monitor) => run_monitor(args.data_dir, monitor).await,
        Command::Extract => run_extract(args.data_dir).await,
    }
}

/// Serves the control panel until a termination signal arrives.
async fn run_server(data_dir: PathBuf, args: ServeArgs) -> io::Result<()> {
    let storage = Arc::new(Storage::new(data_dir));
    storage.ensure_root().await?;

    let session = Arc::new(MonitorSession::new(
        MonitorCommand::current_exe(storage.root_path())?,
        storage.log_path(),
        Duration::from_secs(args.stop_grace_secs),
    ));
    let app = http::build_router(
        storage.clone(),
        session.clone(),
        args.cors_origins.as_deref(),
    );

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("🚀 Starting control panel at http://{}", addr);
    info!(data_dir = %storage.root_path().display(), "using data directory");

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    let reaper = spawn_background_tasks(session.clone());
    let result = tokio::select! {
        result = server => result,
        _ = shutdown_signal(handle, session.clone()) => Ok(()),
    };
    reaper.abort();

    if let Err(err) = session.stop().await {
        warn!(error = %err, "failed to stop monitor on exit");
    }
    result
}

/// Stops the monitor first so open log streams end, then drains connections.
async fn shutdown_signal(handle: Handle, session: Arc<MonitorSession>) {
    wait_for_signal().await;
    info!("Received termination signal shutting down");
    if let Err(err) = session.stop().await {
        warn!(error = %err, "failed to stop monitor");
    }
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
    // 保持 select 分支挂起，直到服务器自行退出
    std::future::pending::<()>().await;
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Loads and validates settings from the data directory.
async fn load_settings(storage: &Storage) -> io::Result<Settings> {
    storage.ensure_root().await?;
    let settings = Settings::load(&storage.settings_path()).await;
    settings
        .validate()
        .map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
    if settings.base_url.trim().is_empty() {
        warn!("no upload server configured, uploads will fail until one is set");
    }
    Ok(settings)
}

fn build_monitor(
    storage: Storage,
    settings: &Settings,
    timings: MonitorTimings,
) -> io::Result<Monitor<SshDevice, FileBrowserClient>> {
    let uploader = FileBrowserClient::new(settings).map_err(io::Error::other)?;
    Ok(Monitor::new(
        SshDevice::from_settings(settings),
        uploader,
        storage,
        timings,
    )
    .delete_archive_after_upload(settings.delete_archive_after_upload))
}

/// Runs the monitor loop in the foreground until interrupted.
async fn run_monitor(data_dir: PathBuf, args: MonitorArgs) -> io::Result<()> {
    let storage = Storage::new(data_dir);
    let settings = load_settings(&storage).await?;

    let ledger = Ledger::new(storage.ledger_path());
    let known = ledger.load().await.map_err(|err| {
        error!(path = %ledger.path().display(), error = %err, "upload ledger is unreadable");
        io::Error::other(err)
    })?;
    info!(
        device = %format!("{}@{}:{}", settings.device_user, settings.device_host, settings.device_port),
        server = %settings.base_url,
        uploaded = known.len(),
        "rlog monitor started"
    );

    let timings = MonitorTimings {
        poll_interval: Duration::from_secs(args.poll_secs),
        connect_backoff: Duration::from_secs(args.connect_backoff_secs),
        auth_backoff: Duration::from_secs(args.auth_backoff_secs),
        error_backoff: Duration::from_secs(args.error_backoff_secs),
    };
    let monitor = build_monitor(storage, &settings, timings)?;

    tokio::select! {
        result = monitor.run() => result.map_err(|err| {
            error!(error = %err, "monitor stopped");
            io::Error::other(err)
        }),
        _ = wait_for_signal() => {
            match monitor.ledger().count().await {
                Ok(total) => info!(total, "Monitor stopped by user"),
                Err(err) => warn!(error = %err, "Monitor stopped by user, ledger unreadable"),
            }
            Ok(())
        }
    }
}

/// One-shot extraction. Exits non-zero unless the archive was uploaded.
async fn run_extract(data_dir: PathBuf) -> io::Result<()> {
    let storage = Storage::new(data_dir);
    let settings = load_settings(&storage).await?;
    info!(
        device = %format!("{}@{}:{}", settings.device_user, settings.device_host, settings.device_port),
        "extracting all rlogs"
    );
    let monitor = build_monitor(storage, &settings, MonitorTimings::default())?;

    let outcome = tokio::select! {
        result = monitor.extract_once() => result.map_err(io::Error::other)?,
        _ = wait_for_signal() => {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "extraction interrupted"));
        }
    };
    match outcome {
        CycleOutcome::Uploaded { url, routes, .. } => {
            info!(%url, routes, "all done");
            Ok(())
        }
        CycleOutcome::NothingNew => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no rlogs found on device",
        )),
        CycleOutcome::ConnectFailed => Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "could not connect to device",
        )),
        CycleOutcome::AuthFailed { archive } => Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("login failed, local archive kept at {}", archive.display()),
        )),
        CycleOutcome::UploadFailed { archive } => Err(io::Error::other(format!(
            "upload failed, local archive kept at {}",
            archive.display()
        ))),
    }
}
