//! 文件列表、下载、删除、建目录与重命名处理器。

use axum::extract::{Extension, Json, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Json as JsonResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::DEFAULT_LIST_LIMIT;
use crate::error::ApiError;
use crate::session::Owner;
use crate::storage::{ListOptions, Listing, SortKey, SortOrder, Storage};
use crate::transfer::{Disposition, serve_file};

#[derive(Deserialize, Default)]
pub(crate) struct ListQuery {
    path: Option<String>,
    #[serde(default)]
    sort: SortKey,
    #[serde(default)]
    order: SortOrder,
    offset: Option<usize>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
pub(crate) struct DownloadQuery {
    path: String,
    #[serde(default)]
    download: bool,
}

#[derive(Deserialize)]
pub(crate) struct RequiredPathQuery {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct DirCreateBody {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct RenameBody {
    from: String,
    to: String,
}

#[derive(Serialize)]
pub(crate) struct PathResponse {
    path: String,
}

fn require_path(path: &str) -> Result<(), ApiError> {
    if path.trim().is_empty() {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    Ok(())
}

/// 列出目录内容，支持排序与分页。
pub async fn list_files(
    owner: Owner,
    Query(query): Query<ListQuery>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<JsonResponse<Listing>, ApiError> {
    let options = ListOptions {
        sort: query.sort,
        order: query.order,
        offset: query.offset.unwrap_or(0),
        limit: query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(DEFAULT_LIST_LIMIT),
    };
    let listing = storage.list_dir(query.path.as_deref(), &options).await?;
    info!(
        caller = owner.principal,
        path = listing.path,
        total = listing.total,
        count = listing.entries.len(),
        "list files"
    );
    Ok(JsonResponse(listing))
}

/// 下载文件，支持 Range、多段 Range 与条件请求。
pub async fn download_file(
    owner: Owner,
    Query(query): Query<DownloadQuery>,
    request_headers: HeaderMap,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    require_path(&query.path)?;
    let target = storage.resolve(&query.path).await?;
    let disposition = if query.download {
        Disposition::Attachment
    } else {
        Disposition::Inline
    };
    let response = serve_file(&target, &request_headers, disposition).await?;
    info!(
        caller = owner.principal,
        path = target.relative_display(),
        status = response.status().as_u16(),
        "download file"
    );
    Ok(response)
}

/// 删除文件或目录。
pub async fn delete_entry(
    owner: Owner,
    Query(RequiredPathQuery { path }): Query<RequiredPathQuery>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<StatusCode, ApiError> {
    require_path(&path)?;
    storage.delete_path(&path).await?;
    info!(caller = owner.principal, path, "delete entry");
    Ok(StatusCode::NO_CONTENT)
}

/// 创建目录（含父级）。
pub async fn create_directory(
    owner: Owner,
    Extension(storage): Extension<Arc<Storage>>,
    Json(DirCreateBody { path }): Json<DirCreateBody>,
) -> Result<(StatusCode, JsonResponse<PathResponse>), ApiError> {
    require_path(&path)?;
    let created = storage.create_dir(&path).await?;
    info!(
        caller = owner.principal,
        path = created.relative_display(),
        "create directory"
    );
    Ok((
        StatusCode::CREATED,
        JsonResponse(PathResponse {
            path: created.relative_display(),
        }),
    ))
}

/// 在存储根目录内移动或重命名。
pub async fn rename_entry(
    owner: Owner,
    Extension(storage): Extension<Arc<Storage>>,
    Json(RenameBody { from, to }): Json<RenameBody>,
) -> Result<JsonResponse<PathResponse>, ApiError> {
    require_path(&from)?;
    require_path(&to)?;
    let target = storage.rename_path(&from, &to).await?;
    info!(
        caller = owner.principal,
        from,
        to = target.relative_display(),
        "rename entry"
    );
    Ok(JsonResponse(PathResponse {
        path: target.relative_display(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::{NameLookup, NameTable, OwnershipCache};
    use crate::sandbox::Sandbox;
    use axum::body::to_bytes;
    use axum::http::{HeaderValue, header};
    use std::collections::HashMap;
    use std::io;
    use tempfile::tempdir;

    struct NoNames;

    impl NameLookup for NoNames {
        fn user_name(&self, _uid: u32) -> Option<String> {
            None
        }

        fn group_name(&self, _gid: u32) -> Option<String> {
            None
        }
    }

    impl NameTable for NoNames {
        fn load_users(&self) -> io::Result<HashMap<u32, String>> {
            Ok(HashMap::new())
        }

        fn load_groups(&self) -> io::Result<HashMap<u32, String>> {
            Ok(HashMap::new())
        }
    }

    fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        let names = Arc::new(NoNames);
        let cache = Arc::new(OwnershipCache::new(names.clone(), names));
        (temp, Arc::new(Storage::new(Sandbox::new(root), cache)))
    }

    #[tokio::test]
    async fn download_rejects_traversal_path() {
        let (_temp, storage) = make_storage();
        let result = download_file(
            Owner::new("alice"),
            Query(DownloadQuery {
                path: "../../etc/passwd".to_string(),
                download: false,
            }),
            HeaderMap::new(),
            Extension(storage),
        )
        .await;

        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn download_serves_requested_range() {
        let (_temp, storage) = make_storage();
        let root = storage.sandbox().root_path().to_path_buf();
        std::fs::write(root.join("movie.bin"), vec![7u8; 1000]).expect("write");

        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, HeaderValue::from_static("bytes=-100"));
        let response = download_file(
            Owner::new("alice"),
            Query(DownloadQuery {
                path: "movie.bin".to_string(),
                download: true,
            }),
            headers,
            Extension(storage),
        )
        .await
        .expect("download");
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        assert_eq!(body.len(), 100);
    }

    #[tokio::test]
    async fn download_refuses_upload_staging_files() {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        let staging = root.join(".uploads").join("session-1");
        std::fs::create_dir_all(&staging).expect("create staging");
        std::fs::write(staging.join("chunk_0"), b"secret").expect("write chunk");
        let names = Arc::new(NoNames);
        let cache = Arc::new(OwnershipCache::new(names.clone(), names));
        let hidden = root.join(".uploads").canonicalize().expect("canonical");
        let storage = Arc::new(Storage::new(Sandbox::new(root), cache).with_hidden(hidden));

        let result = download_file(
            Owner::new("mallory"),
            Query(DownloadQuery {
                path: ".uploads/session-1/chunk_0".to_string(),
                download: true,
            }),
            HeaderMap::new(),
            Extension(storage),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn delete_refuses_storage_root() {
        let (_temp, storage) = make_storage();
        let result = delete_entry(
            Owner::new("alice"),
            Query(RequiredPathQuery {
                path: "/".to_string(),
            }),
            Extension(storage.clone()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Forbidden(_))));
        assert!(storage.sandbox().root_path().exists());
    }

    #[tokio::test]
    async fn mkdir_and_rename_stay_inside_root() {
        let (_temp, storage) = make_storage();
        let (status, JsonResponse(created)) = create_directory(
            Owner::new("alice"),
            Extension(storage.clone()),
            Json(DirCreateBody {
                path: "photos/2024".to_string(),
            }),
        )
        .await
        .expect("mkdir");
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.path, "photos/2024");

        let JsonResponse(renamed) = rename_entry(
            Owner::new("alice"),
            Extension(storage.clone()),
            Json(RenameBody {
                from: "photos/2024".to_string(),
                to: "photos/archive".to_string(),
            }),
        )
        .await
        .expect("rename");
        assert_eq!(renamed.path, "photos/archive");

        let escape = rename_entry(
            Owner::new("alice"),
            Extension(storage),
            Json(RenameBody {
                from: "photos/archive".to_string(),
                to: "../outside".to_string(),
            }),
        )
        .await;
        assert!(matches!(escape, Err(ApiError::Forbidden(_))));
    }

    #[tokio::test]
    async fn list_reports_total_and_page() {
        let (_temp, storage) = make_storage();
        let root = storage.sandbox().root_path().to_path_buf();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(root.join(name), b"x").expect("write");
        }
        let JsonResponse(listing) = list_files(
            Owner::new("alice"),
            Query(ListQuery {
                limit: Some(2),
                ..ListQuery::default()
            }),
            Extension(storage),
        )
        .await
        .expect("list");
        assert_eq!(listing.total, 3);
        assert_eq!(listing.entries.len(), 2);
        assert_eq!(listing.entries[0].name, "a.txt");
    }
}
