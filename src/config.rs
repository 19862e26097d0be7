//! CLI arguments and configuration defaults.

use clap::{Args as ClapArgs, Parser, Subcommand};
use shadow_rs::formatcp;
use std::path::PathBuf;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const SETTINGS_FILE_NAME: &str = "config.json";
pub const LEDGER_FILE_NAME: &str = "uploaded_logs.json";
pub const MONITOR_LOG_FILE_NAME: &str = "rlog_monitor.log";
pub const STAGING_DIR_NAME: &str = "comma_rlogs_temp";

pub const DEVICE_ROUTES_DIR: &str = "/data/media/0/realdata";
pub const DEVICE_ID_PATH: &str = "/data/params/d/DongleId";
pub const PAYLOAD_FILE_NAME: &str = "rlog.zst";
pub const UNKNOWN_DEVICE_ID: &str = "unknown";
pub const DEFAULT_DEVICE_HOST: &str = "192.168.173.10";
pub const DEFAULT_DEVICE_USER: &str = "comma";
pub const DEFAULT_DEVICE_PORT: u16 = 22;

pub const SSH_PROBE_TIMEOUT_SECS: u64 = 2;
pub const SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const SSH_SESSION_TIMEOUT_SECS: u64 = 30;
pub const LOGIN_TIMEOUT_SECS: u64 = 30;
pub const UPLOAD_TIMEOUT_SECS: u64 = 600;

pub const DEFAULT_POLL_SECS: u64 = 5;
pub const DEFAULT_CONNECT_BACKOFF_SECS: u64 = 30;
pub const DEFAULT_AUTH_BACKOFF_SECS: u64 = 60;
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 30;

pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;
pub const LOG_REPLAY_LINES: usize = 50;
pub const LOG_POLL_INTERVAL_MS: u64 = 100;
pub const CHILD_REAP_INTERVAL_SECS: u64 = 5;

/// CLI arguments and environment configuration.
#[derive(Parser, Debug)]
#[command(name = "rlog-relay", version = VERSION_INFO, about = "Device rlog auto-uploader")]
pub struct Args {
    #[arg(
        short = 'd',
        long,
        global = true,
        env = "RLOG_DATA_DIR",
        default_value = "data",
        help = "Directory holding settings, ledger, log and archives"
    )]
    pub data_dir: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the web control panel.
    Serve(ServeArgs),
    /// Run the monitor loop in the foreground.
    Monitor(MonitorArgs),
    /// Download every rlog once, archive and upload it, then exit.
    Extract,
}

#[derive(ClapArgs, Debug)]
pub struct ServeArgs {
    #[arg(
        short = 'b',
        long,
        env = "RLOG_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "RLOG_PORT",
        default_value_t = 3111,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(long, env = "RLOG_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "RLOG_STOP_GRACE_SECS",
        default_value_t = DEFAULT_STOP_GRACE_SECS,
        help = "Seconds to wait after SIGTERM before killing the monitor"
    )]
    pub stop_grace_secs: u64,
}

#[derive(ClapArgs, Debug)]
pub struct MonitorArgs {
    #[arg(
        long,
        env = "RLOG_POLL_SECS",
        default_value_t = DEFAULT_POLL_SECS,
        help = "Device reachability poll interval in seconds"
    )]
    pub poll_secs: u64,
    #[arg(
        long,
        env = "RLOG_CONNECT_BACKOFF_SECS",
        default_value_t = DEFAULT_CONNECT_BACKOFF_SECS,
        help = "Delay after a failed device connection"
    )]
    pub connect_backoff_secs: u64,
    #[arg(
        long,
        env = "RLOG_AUTH_BACKOFF_SECS",
        default_value_t = DEFAULT_AUTH_BACKOFF_SECS,
        help = "Delay after a failed upload login"
    )]
    pub auth_backoff_secs: u64,
    #[arg(
        long,
        env = "RLOG_ERROR_BACKOFF_SECS",
        default_value_t = DEFAULT_ERROR_BACKOFF_SECS,
        help = "Delay after an unexpected cycle error"
    )]
    pub error_backoff_secs: u64,
}
