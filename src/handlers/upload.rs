//! 分片上传处理器：初始化、写入分片、查询进度、完成、取消与列出会话。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Path};
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::fs;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::error::ApiError;
use crate::sandbox::is_plain_name;
use crate::session::{Owner, Progress, UploadSession, total_chunks_for};
use crate::storage::Storage;
use crate::upload::{NewSession, UploadManager};
use crate::validation::UploadPolicy;

/// 初始化阶段的限制，与会话管理器的运行参数分开保存。
#[derive(Debug, Clone)]
pub struct UploadLimits {
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
    pub max_chunks: u64,
    pub policy: UploadPolicy,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadInitRequest {
    name: String,
    total_size: u64,
    #[serde(default)]
    path: String,
    chunk_size: Option<u64>,
    mime_type: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadInitResponse {
    upload_id: String,
    chunk_size: u64,
    total_chunks: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadSummary {
    upload_id: String,
    filename: String,
    total_size: u64,
    chunk_size: u64,
    target_path: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    #[serde(flatten)]
    progress: Progress,
}

impl UploadSummary {
    fn new(session: &UploadSession, progress: Progress) -> Self {
        Self {
            upload_id: session.id.clone(),
            filename: session.filename.clone(),
            total_size: session.total_size,
            chunk_size: session.chunk_size,
            target_path: session.target_path.clone(),
            created_at: session.created_at,
            expires_at: session.expires_at,
            progress,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct UploadCompleteResponse {
    path: String,
}

/// 初始化上传会话；文件名、目标目录与上传策略都在写入任何字节前校验。
pub async fn init_upload(
    owner: Owner,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(uploads): Extension<Arc<UploadManager>>,
    Extension(limits): Extension<Arc<UploadLimits>>,
    Json(payload): Json<UploadInitRequest>,
) -> Result<(StatusCode, JsonResponse<UploadInitResponse>), ApiError> {
    let name = payload.name.trim().to_string();
    if !is_plain_name(&name) {
        return Err(ApiError::BadRequest("invalid file name".into()));
    }

    let chunk_size = payload.chunk_size.unwrap_or(limits.default_chunk_size);
    if chunk_size == 0 || chunk_size > limits.max_chunk_size {
        return Err(ApiError::BadRequest(format!(
            "chunk size must be between 1 and {} bytes",
            limits.max_chunk_size
        )));
    }
    let total_chunks = total_chunks_for(payload.total_size, chunk_size);
    if limits.max_chunks > 0 && total_chunks > limits.max_chunks {
        return Err(ApiError::PayloadTooLarge(
            "upload chunk count exceeds limit".into(),
        ));
    }
    limits
        .policy
        .validate(&name, payload.total_size, payload.mime_type.as_deref())?;

    let target_dir = storage.resolve(&payload.path).await?;
    match fs::metadata(target_dir.as_path()).await {
        Ok(metadata) if !metadata.is_dir() => {
            return Err(ApiError::BadRequest("target path is not a directory".into()));
        }
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(ApiError::Internal(err.to_string())),
    }

    let session = uploads
        .create_session(
            NewSession {
                filename: name,
                total_size: payload.total_size,
                target_dir: target_dir.relative_display(),
                chunk_size: Some(chunk_size),
                mime_type: payload.mime_type,
            },
            &owner,
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        JsonResponse(UploadInitResponse {
            upload_id: session.id,
            chunk_size: session.chunk_size,
            total_chunks: session.total_chunks,
            expires_at: session.expires_at,
        }),
    ))
}

/// 以原始请求体写入单个分片。
pub async fn upload_chunk(
    owner: Owner,
    Path((upload_id, index)): Path<(String, u64)>,
    Extension(uploads): Extension<Arc<UploadManager>>,
    body: AxumBody,
) -> Result<JsonResponse<Progress>, ApiError> {
    let stream = BodyExt::into_data_stream(body).map_err(io::Error::other);
    let reader = StreamReader::new(stream);
    let progress = uploads
        .upload_chunk(&upload_id, index, reader, &owner)
        .await?;
    debug!(upload_id, index, "chunk accepted");
    Ok(JsonResponse(progress))
}

/// 查询上传进度，用于断点续传。
pub async fn upload_status(
    owner: Owner,
    Path(upload_id): Path<String>,
    Extension(uploads): Extension<Arc<UploadManager>>,
) -> Result<JsonResponse<UploadSummary>, ApiError> {
    let session = uploads.session(&upload_id, &owner).await?;
    let progress = uploads.progress(&upload_id).await?;
    Ok(JsonResponse(UploadSummary::new(&session, progress)))
}

/// 合并分片并落盘，返回相对存储根目录的文件路径。
pub async fn complete_upload(
    owner: Owner,
    Path(upload_id): Path<String>,
    Extension(uploads): Extension<Arc<UploadManager>>,
) -> Result<JsonResponse<UploadCompleteResponse>, ApiError> {
    let session = uploads.session(&upload_id, &owner).await?;
    uploads.finalize(&upload_id, &owner).await?;
    let path = if session.target_path.is_empty() {
        session.filename
    } else {
        format!("{}/{}", session.target_path, session.filename)
    };
    info!(upload_id, caller = owner.principal, path, "upload completed");
    Ok(JsonResponse(UploadCompleteResponse { path }))
}

/// 取消上传并删除临时数据。
pub async fn abort_upload(
    owner: Owner,
    Path(upload_id): Path<String>,
    Extension(uploads): Extension<Arc<UploadManager>>,
) -> Result<StatusCode, ApiError> {
    uploads.delete_session(&upload_id, &owner).await?;
    info!(upload_id, caller = owner.principal, "upload aborted");
    Ok(StatusCode::NO_CONTENT)
}

/// 列出调用方自己的未完成上传。
pub async fn list_uploads(
    owner: Owner,
    Extension(uploads): Extension<Arc<UploadManager>>,
) -> Result<JsonResponse<Vec<UploadSummary>>, ApiError> {
    let sessions = uploads.list_sessions_for_owner(&owner.id).await;
    Ok(JsonResponse(
        sessions
            .iter()
            .map(|session| UploadSummary::new(session, session.progress()))
            .collect(),
    ))
}
