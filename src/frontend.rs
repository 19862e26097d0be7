//! 嵌入式控制面板页面。

use axum::body::Body as AxumBody;
use axum::http::{HeaderMap, HeaderValue, Request, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

use crate::error::ApiError;

#[derive(RustEmbed)]
#[folder = "frontend"]
/// 嵌入式控制面板资源。
pub struct PanelAssets;

/// 静态资源回退处理器；未知的 API 路径返回 404。
pub async fn serve_frontend(req: Request<AxumBody>) -> Result<Response, ApiError> {
    let path = req.uri().path().trim_start_matches('/');
    if path.starts_with("api/") {
        return Err(ApiError::NotFound(format!("no such endpoint: /{path}")));
    }
    let requested = if path.is_empty() { "index.html" } else { path };
    if let Some(response) = load_embedded_asset(requested)? {
        return Ok(response);
    }

    if !requested.contains('.')
        && let Some(response) = load_embedded_asset("index.html")?
    {
        return Ok(response);
    }

    Err(ApiError::NotFound("not found".into()))
}

fn load_embedded_asset(path: &str) -> Result<Option<Response>, ApiError> {
    let Some(asset) = PanelAssets::get(path) else {
        return Ok(None);
    };
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(Some(
        (headers, AxumBody::from(asset.data.into_owned())).into_response(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn request(path: &str) -> Request<AxumBody> {
        Request::builder()
            .uri(path)
            .body(AxumBody::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn root_serves_the_panel() {
        let response = serve_frontend(request("/"))
            .await
            .unwrap_or_else(|_| panic!("panel missing"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/html"))
        );
    }

    #[tokio::test]
    async fn unknown_api_path_is_not_found() {
        let result = serve_frontend(request("/api/nope")).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
        let result = serve_frontend(request("/missing.js")).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }
}
