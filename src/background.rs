//! 过期上传会话清理与属主名称缓存刷新的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ownership::OwnershipCache;
use crate::upload::UploadManager;

/// 启动后台任务（会话清理与属主缓存刷新），取消令牌触发后退出。
pub fn spawn_background_tasks(
    uploads: Arc<UploadManager>,
    ownership: Arc<OwnershipCache>,
    sweep_interval: Duration,
    refresh_interval: Duration,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let sweep_cancel = cancel.clone();
    let sweep = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = sweep_cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match uploads.sweep_expired().await {
                Ok(0) => debug!("upload sweep found nothing to remove"),
                Ok(removed) => {
                    let active = uploads.active_sessions().await;
                    info!(removed, active, "upload sweep finished");
                }
                Err(err) => warn!(error = %err, "upload sweep failed"),
            }
        }
        debug!("upload sweep task stopped");
    });

    let refresh = tokio::spawn(async move {
        let mut interval = tokio::time::interval(refresh_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let cache = ownership.clone();
            match tokio::task::spawn_blocking(move || cache.refresh()).await {
                Ok(Ok(())) => debug!("owner name tables refreshed"),
                Ok(Err(err)) => warn!(error = %err, "owner name refresh failed, keeping previous tables"),
                Err(err) => warn!(error = %err, "owner name refresh task panicked"),
            }
        }
        debug!("owner refresh task stopped");
    });

    vec![sweep, refresh]
}
