//! 内存路径锁：串行化对同一目标文件的合并落盘。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

#[derive(Debug)]
pub struct LockTimeout;

/// Manages asynchronous mutexes keyed by absolute target path.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在给定超时时间内获取路径锁。
    pub async fn lock_path_with_timeout(
        &self,
        path: &Path,
        timeout: Duration,
    ) -> Result<OwnedMutexGuard<()>, LockTimeout> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // 无人持有的锁直接丢弃，避免表无限增长。
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| LockTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out() {
        let manager = LockManager::new();
        let path = Path::new("/srv/share/file.bin");
        let _guard = manager
            .lock_path_with_timeout(path, Duration::from_millis(50))
            .await
            .expect("first lock");

        let second = manager
            .lock_path_with_timeout(path, Duration::from_millis(50))
            .await;
        assert!(second.is_err());

        let other = manager
            .lock_path_with_timeout(Path::new("/srv/share/other.bin"), Duration::from_millis(50))
            .await;
        assert!(other.is_ok());
    }
}
