//! FileBrowser 上传客户端：令牌登录与单文件上传。

use reqwest::{Body, Client, StatusCode};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::config::{LOGIN_TIMEOUT_SECS, UPLOAD_TIMEOUT_SECS};
use crate::settings::Settings;

#[derive(Debug)]
pub enum UploadError {
    Transport(reqwest::Error),
    Status { status: StatusCode, body: String },
    Io(io::Error),
}

impl fmt::Display for UploadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadError::Transport(err) => write!(f, "request failed: {err}"),
            UploadError::Status { status, body } => write!(f, "server returned {status}: {body}"),
            UploadError::Io(err) => write!(f, "local file error: {err}"),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Transport(err)
    }
}

impl From<io::Error> for UploadError {
    fn from(err: io::Error) -> Self {
        UploadError::Io(err)
    }
}

/// 归档的上传目标。
pub trait ArchiveUploader {
    fn authenticate(&self) -> impl Future<Output = Result<String, UploadError>> + Send;

    /// 返回上传后文件的访问地址。
    fn upload(
        &self,
        token: &str,
        archive: &Path,
    ) -> impl Future<Output = Result<String, UploadError>> + Send;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Clone, Debug)]
pub struct FileBrowserClient {
    http: Client,
    base_url: String,
    upload_path: String,
    username: String,
    password: String,
}

impl FileBrowserClient {
    pub fn new(settings: &Settings) -> Result<Self, UploadError> {
        let http = Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            upload_path: normalize_upload_path(&settings.upload_path),
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    fn public_url(&self, file_name: &str) -> String {
        format!("{}{}{}", self.base_url, self.upload_path, file_name)
    }
}

/// 确保上传路径以 `/` 开头和结尾。
fn normalize_upload_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// 截断错误响应体，保证单行日志。
fn truncate_body(body: String) -> String {
    body.chars().take(200).collect()
}

impl ArchiveUploader for FileBrowserClient {
    async fn authenticate(&self) -> Result<String, UploadError> {
        info!("logging in to FileBrowser");
        let response = self
            .http
            .post(format!("{}/api/login", self.base_url))
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .timeout(Duration::from_secs(LOGIN_TIMEOUT_SECS))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status != StatusCode::OK {
            warn!(%status, "login failed");
            return Err(UploadError::Status {
                status,
                body: truncate_body(body),
            });
        }
        info!("login successful");
        Ok(body.trim().trim_matches('"').to_string())
    }

    async fn upload(&self, token: &str, archive: &Path) -> Result<String, UploadError> {
        let file_name = archive
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "archive has no file name"))?;
        let file = File::open(archive).await?;
        let size = file.metadata().await?.len();
        info!(
            file = file_name,
            size_mb = %format!("{:.2}", size as f64 / (1024.0 * 1024.0)),
            "uploading archive"
        );

        let response = self
            .http
            .post(format!(
                "{}/api/resources{}{}",
                self.base_url, self.upload_path, file_name
            ))
            .header("X-Auth", token)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "upload failed");
            return Err(UploadError::Status {
                status,
                body: truncate_body(body),
            });
        }
        let url = self.public_url(&file_name);
        info!(url, "upload complete");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::{Json, Path as AxumPath};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::post;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct Received {
        uploads: Vec<(String, Option<String>, Vec<u8>)>,
    }

    /// 最小化的 FileBrowser 替身；文件名含 "reject" 的上传返回失败。
    async fn spawn_server(received: Arc<Mutex<Received>>) -> String {
        let app = Router::new()
            .route(
                "/api/login",
                post(|Json(body): Json<serde_json::Value>| async move {
                    if body["username"] == "operator" && body["password"] == "secret" {
                        (AxumStatus::OK, "\"token-123\"")
                    } else {
                        (AxumStatus::FORBIDDEN, "403 Forbidden")
                    }
                }),
            )
            .route(
                "/api/resources/{*path}",
                post(
                    move |AxumPath(path): AxumPath<String>, headers: HeaderMap, body: Bytes| {
                        let received = received.clone();
                        async move {
                            let token = headers
                                .get("X-Auth")
                                .and_then(|value| value.to_str().ok())
                                .map(str::to_string);
                            let rejected = path.contains("reject");
                            received
                                .lock()
                                .expect("received")
                                .uploads
                                .push((path, token, body.to_vec()));
                            if rejected {
                                (AxumStatus::INTERNAL_SERVER_ERROR, "disk full")
                            } else {
                                (AxumStatus::CREATED, "")
                            }
                        }
                    },
                ),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn client(base_url: &str, password: &str) -> FileBrowserClient {
        let settings = Settings {
            base_url: base_url.to_string(),
            upload_path: "/VW Passat/".to_string(),
            username: "operator".to_string(),
            password: password.to_string(),
            ..Settings::default()
        };
        FileBrowserClient::new(&settings).expect("client")
    }

    #[test]
    fn upload_path_is_normalized() {
        assert_eq!(normalize_upload_path("logs"), "/logs/");
        assert_eq!(normalize_upload_path("/logs/"), "/logs/");
        assert_eq!(normalize_upload_path(""), "/");
    }

    #[tokio::test]
    async fn login_returns_unquoted_token() {
        let base = spawn_server(Arc::default()).await;
        let token = client(&base, "secret").authenticate().await.expect("login");
        assert_eq!(token, "token-123");
    }

    #[tokio::test]
    async fn bad_credentials_are_a_failure_value() {
        let base = spawn_server(Arc::default()).await;
        let result = client(&base, "wrong").authenticate().await;
        assert!(matches!(
            result,
            Err(UploadError::Status { status, .. }) if status == StatusCode::FORBIDDEN
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_failure_value() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let result = client(&format!("http://{addr}"), "secret").authenticate().await;
        assert!(matches!(result, Err(UploadError::Transport(_))));
    }

    #[tokio::test]
    async fn upload_posts_file_with_token() {
        let received = Arc::new(Mutex::new(Received::default()));
        let base = spawn_server(received.clone()).await;
        let temp = tempdir().expect("tempdir");
        let archive = temp.path().join("dongle-rlogs-20240101-000000.tar.gz");
        std::fs::write(&archive, b"archive-bytes").expect("write");

        let url = client(&base, "secret")
            .upload("token-123", &archive)
            .await
            .expect("upload");

        assert_eq!(
            url,
            format!("{base}/VW Passat/dongle-rlogs-20240101-000000.tar.gz")
        );
        let received = received.lock().expect("received");
        assert_eq!(received.uploads.len(), 1);
        let (path, token, body) = &received.uploads[0];
        assert_eq!(path, "VW Passat/dongle-rlogs-20240101-000000.tar.gz");
        assert_eq!(token.as_deref(), Some("token-123"));
        assert_eq!(body, b"archive-bytes");
    }

    #[tokio::test]
    async fn rejected_upload_is_a_failure_value() {
        let base = spawn_server(Arc::default()).await;
        let temp = tempdir().expect("tempdir");
        let archive = temp.path().join("reject-me.tar.gz");
        std::fs::write(&archive, b"x").expect("write");

        let result = client(&base, "secret").upload("token-123", &archive).await;
        assert!(matches!(
            result,
            Err(UploadError::Status { status, .. }) if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
    }
}
