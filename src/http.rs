//! HTTP 辅助工具：调用方身份提取、CORS 与安全头。

use axum::body::Body as AxumBody;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::{middleware, response::Response};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::config::{
    IDENTITY_GID_HEADER, IDENTITY_ID_HEADER, IDENTITY_PRINCIPAL_HEADER, IDENTITY_UID_HEADER,
};
use crate::error::ApiError;
use crate::session::Owner;

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn header_id(headers: &HeaderMap, name: &str) -> Result<Option<u32>, ApiError> {
    header_text(headers, name)
        .map(|value| {
            value
                .parse::<u32>()
                .map_err(|_| ApiError::BadRequest(format!("invalid {name} header")))
        })
        .transpose()
}

/// 从上游认证代理注入的请求头解析调用方身份。
pub fn owner_from_headers(headers: &HeaderMap) -> Result<Owner, ApiError> {
    let Some(id) = header_text(headers, IDENTITY_ID_HEADER) else {
        return Err(ApiError::Unauthorized("caller identity required".into()));
    };
    let mut owner = Owner::new(id);
    if let Some(principal) = header_text(headers, IDENTITY_PRINCIPAL_HEADER) {
        owner.principal = principal.to_string();
    }
    owner.uid = header_id(headers, IDENTITY_UID_HEADER)?;
    owner.gid = header_id(headers, IDENTITY_GID_HEADER)?;
    Ok(owner)
}

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        owner_from_headers(&parts.headers)
    }
}

/// 构建 CORS Layer（支持逗号分隔的来源列表）。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any),
    )
}

/// 添加基础安全响应头。
pub async fn add_security_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        axum::http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}
