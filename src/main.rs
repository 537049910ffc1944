//! Dockyard server binary.
//!
//! Serves a sandboxed shared directory over HTTP: directory listings with
//! owner names, range-capable downloads, and resumable chunked uploads. The
//! caller identity is taken from headers injected by an upstream auth proxy.

mod atomic;
mod background;
mod config;
mod error;
mod etag;
mod handlers;
mod http;
mod locking;
mod logging;
mod ownership;
mod sandbox;
mod session;
mod storage;
mod tls;
mod transfer;
mod upload;
mod validation;
mod version;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::routing::{delete, get, post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::background::spawn_background_tasks;
use crate::config::{Args, DEFAULT_LOCK_WAIT_TIMEOUT_SECS, IDENTITY_ID_HEADER};
use crate::handlers::upload::UploadLimits;
use crate::http::build_cors_layer;
use crate::ownership::OwnershipCache;
use crate::sandbox::Sandbox;
use crate::storage::Storage;
use crate::upload::{UploadManager, UploadSettings};
use crate::validation::UploadPolicy;

shadow!(build);

/// Starts the Dockyard server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    if args.upload_chunk_size == 0 || args.upload_chunk_size > args.upload_max_chunk_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "upload chunk size must be between 1 and the maximum chunk size",
        ));
    }

    let sandbox = Sandbox::new(PathBuf::from(&args.storage_dir));
    sandbox.ensure_root().await?;
    let temp_root = PathBuf::from(&args.upload_temp_dir);
    tokio::fs::create_dir_all(&temp_root).await?;

    let ownership = Arc::new(OwnershipCache::system(
        PathBuf::from(&args.passwd_file),
        PathBuf::from(&args.group_file),
    ));
    let initial = ownership.clone();
    match tokio::task::spawn_blocking(move || initial.refresh()).await {
        Ok(Ok(())) => info!(
            refreshed_at = ?ownership.refreshed_at(),
            "owner name tables loaded"
        ),
        Ok(Err(err)) => warn!(error = %err, "owner name tables unavailable, using per-id lookups"),
        Err(err) => warn!(error = %err, "owner name table load task failed"),
    }

    let uploads = Arc::new(
        UploadManager::open(
            UploadSettings {
                temp_root: temp_root.clone(),
                default_chunk_size: args.upload_chunk_size,
                max_concurrent: args.upload_max_concurrent,
                session_ttl: Duration::from_secs(args.upload_session_ttl_secs),
                lock_timeout: Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
            },
            sandbox.clone(),
        )
        .await?,
    );

    let mut storage = Storage::new(sandbox.clone(), ownership.clone());
    if let Some(hidden) = nested_temp_dir(sandbox.root_path(), &temp_root).await {
        info!(path = ?hidden, "upload temp dir hidden from listings");
        storage = storage.with_hidden(hidden);
    }
    let storage = Arc::new(storage);

    let limits = Arc::new(UploadLimits {
        default_chunk_size: args.upload_chunk_size,
        max_chunk_size: args.upload_max_chunk_size,
        max_chunks: args.upload_max_chunks,
        policy: UploadPolicy::new(
            args.upload_max_size,
            &args.allowed_extensions,
            &args.denied_extensions,
            &args.allowed_mime_types,
            &args.denied_mime_types,
        ),
    });

    let mut app = Router::new()
        .route("/api/files/list", get(handlers::files::list_files))
        .route("/api/files/download", get(handlers::files::download_file))
        .route("/api/files/delete", delete(handlers::files::delete_entry))
        .route("/api/files/mkdir", post(handlers::files::create_directory))
        .route("/api/files/rename", post(handlers::files::rename_entry))
        .route("/api/upload/init", post(handlers::upload::init_upload))
        .route(
            "/api/upload/{id}/chunks/{index}",
            put(handlers::upload::upload_chunk).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/upload/{id}",
            get(handlers::upload::upload_status).delete(handlers::upload::abort_upload),
        )
        .route(
            "/api/upload/{id}/complete",
            post(handlers::upload::complete_upload),
        )
        .route("/api/uploads", get(handlers::upload::list_uploads))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let caller = request
                        .headers()
                        .get(IDENTITY_ID_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("anonymous")
                        .to_string();

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        caller,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(uploads.clone()))
        .layer(Extension(limits));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let https = match args.https_port {
        Some(port) => Some((
            SocketAddr::new(host, port),
            tls::build_rustls_config(&args, host).await?,
        )),
        None => None,
    };
    let handle = Handle::new();
    let cancel = CancellationToken::new();

    info!(addr = %http_addr, "starting HTTP server");
    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.clone().into_make_service());
    let https_server = {
        let handle = handle.clone();
        async move {
            match https {
                Some((addr, tls_config)) => {
                    info!(addr = %addr, "starting HTTPS server");
                    axum_server::bind_rustls(addr, tls_config)
                        .handle(handle)
                        .serve(app.into_make_service())
                        .await
                }
                None => std::future::pending::<io::Result<()>>().await,
            }
        }
    };

    let tasks = spawn_background_tasks(
        uploads,
        ownership,
        Duration::from_secs(args.upload_sweep_interval_secs.max(1)),
        Duration::from_secs(args.owner_refresh_interval_secs.max(1)),
        cancel.clone(),
    );
    tokio::spawn(shutdown_signal(handle, cancel.clone()));
    let result = tokio::select! {
        result = http_server => result,
        result = https_server => result,
    };

    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    result
}

/// 上传临时目录位于存储根目录内时，返回其规范化路径以便在列表中隐藏。
async fn nested_temp_dir(root: &Path, temp_root: &Path) -> Option<PathBuf> {
    let root = tokio::fs::canonicalize(root).await.ok()?;
    let temp_root = tokio::fs::canonicalize(temp_root).await.ok()?;
    temp_root.starts_with(&root).then_some(temp_root)
}

/// 收到终止信号后停止后台任务并优雅关闭监听。
async fn shutdown_signal(handle: Handle, cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    cancel.cancel();
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
