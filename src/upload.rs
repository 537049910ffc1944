//! 分片上传会话管理：创建、写入分片、进度查询、合并落盘、重启恢复与过期清理。
//!
//! 会话表由读写锁保护；每个会话自身的可变状态另有一把互斥锁，同一会话的
//! 并发分片只在记账与元数据写入时互相串行，分片数据本身在锁外写盘。所有
//! 修改或完成会话的操作都会校验调用方是否为会话创建者。

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::config::CHUNK_FILE_PREFIX;
use crate::locking::LockManager;
use crate::sandbox::{ResolvedPath, Sandbox, SandboxError, is_plain_name};
use crate::session::{Owner, Progress, UploadSession, total_chunks_for};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload session not found")]
    NotFound,
    #[error("upload session expired")]
    Expired,
    #[error("upload session belongs to another owner")]
    Forbidden,
    #[error("chunk index {index} outside 0..{total}")]
    InvalidIndex { index: u64, total: u64 },
    #[error("expected {expected} bytes, received {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("upload incomplete: {uploaded} of {total} chunks received")]
    IncompleteUpload { uploaded: u64, total: u64 },
    #[error("too many active upload sessions")]
    TooManySessions,
    #[error("target path is busy")]
    Busy,
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub temp_root: PathBuf,
    pub default_chunk_size: u64,
    pub max_concurrent: u64,
    pub session_ttl: Duration,
    pub lock_timeout: Duration,
}

/// 创建会话所需的参数，文件名与目标目录由调用方预先校验。
#[derive(Debug, Clone)]
pub struct NewSession {
    pub filename: String,
    pub total_size: u64,
    pub target_dir: String,
    pub chunk_size: Option<u64>,
    pub mime_type: Option<String>,
}

struct SessionState {
    session: UploadSession,
    closed: bool,
}

/// 会话表中的条目：所有者、过期时间与临时目录在创建后不再变化。
struct SessionEntry {
    owner_id: String,
    expires_at: chrono::DateTime<Utc>,
    temp_dir: PathBuf,
    state: Mutex<SessionState>,
}

impl SessionEntry {
    fn new(session: UploadSession) -> Self {
        Self {
            owner_id: session.owner_id.clone(),
            expires_at: session.expires_at,
            temp_dir: session.temp_dir.clone(),
            state: Mutex::new(SessionState {
                session,
                closed: false,
            }),
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

pub struct UploadManager {
    settings: UploadSettings,
    /// 临时目录的规范化路径，合并目标不能落在其中。
    staging: PathBuf,
    sandbox: Sandbox,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    locks: LockManager,
}

impl UploadManager {
    /// 打开管理器：准备临时目录并从磁盘恢复未过期的会话。
    pub async fn open(settings: UploadSettings, sandbox: Sandbox) -> io::Result<Self> {
        fs::create_dir_all(&settings.temp_root).await?;
        let staging = fs::canonicalize(&settings.temp_root).await?;
        let manager = Self {
            settings,
            staging,
            sandbox,
            sessions: RwLock::new(HashMap::new()),
            locks: LockManager::new(),
        };
        let restored = manager.recover().await?;
        info!(
            restored,
            temp_root = ?manager.settings.temp_root,
            "upload sessions recovered"
        );
        Ok(manager)
    }

    async fn recover(&self) -> io::Result<usize> {
        let now = Utc::now();
        let mut dir = fs::read_dir(&self.settings.temp_root).await?;
        let mut restored = HashMap::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let mut session = match UploadSession::load(&path).await {
                Ok(session) if !session.is_consistent() => {
                    warn!(path = ?path, id = session.id, "inconsistent upload session removed");
                    remove_session_dir(&path).await;
                    continue;
                }
                Ok(session) if session.id == dir_name => session,
                Ok(session) => {
                    warn!(path = ?path, id = session.id, "session id does not match its directory");
                    remove_session_dir(&path).await;
                    continue;
                }
                Err(err) => {
                    warn!(path = ?path, error = %err, "unreadable upload session removed");
                    remove_session_dir(&path).await;
                    continue;
                }
            };
            if session.is_expired(now) {
                info!(id = session.id, "expired upload session removed on startup");
                remove_session_dir(&path).await;
                continue;
            }
            verify_chunks(&mut session).await;
            restored.insert(session.id.clone(), Arc::new(SessionEntry::new(session)));
        }
        let count = restored.len();
        self.sessions.write().await.extend(restored);
        Ok(count)
    }

    /// 创建会话并分配私有临时目录，仅在存储分配失败时报错。
    pub async fn create_session(
        &self,
        request: NewSession,
        owner: &Owner,
    ) -> Result<UploadSession, UploadError> {
        if self.settings.max_concurrent > 0 {
            let active = self.sessions.read().await.len() as u64;
            if active >= self.settings.max_concurrent {
                return Err(UploadError::TooManySessions);
            }
        }

        let chunk_size = request
            .chunk_size
            .filter(|size| *size > 0)
            .unwrap_or(self.settings.default_chunk_size);
        let id = Uuid::new_v4().to_string();
        let temp_dir = self.settings.temp_root.join(&id);
        create_private_dir(&temp_dir).await?;

        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.settings.session_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let session = UploadSession {
            id: id.clone(),
            filename: request.filename,
            total_size: request.total_size,
            chunk_size,
            total_chunks: total_chunks_for(request.total_size, chunk_size),
            uploaded_chunks: BTreeSet::new(),
            target_path: request.target_dir,
            temp_dir: temp_dir.clone(),
            owner_id: owner.id.clone(),
            owner_principal: owner.principal.clone(),
            owner_uid: owner.uid,
            owner_gid: owner.gid,
            mime_type: request.mime_type,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
        };
        if let Err(err) = session.persist().await {
            remove_session_dir(&temp_dir).await;
            return Err(err.into());
        }

        {
            let mut sessions = self.sessions.write().await;
            if self.settings.max_concurrent > 0
                && sessions.len() as u64 >= self.settings.max_concurrent
            {
                drop(sessions);
                remove_session_dir(&temp_dir).await;
                return Err(UploadError::TooManySessions);
            }
            sessions.insert(id.clone(), Arc::new(SessionEntry::new(session.clone())));
        }
        info!(
            upload_id = id,
            owner = session.owner_principal,
            name = session.filename,
            total_size = session.total_size,
            total_chunks = session.total_chunks,
            "upload session created"
        );
        Ok(session)
    }

    /// 写入一个分片；字节数必须与期望长度完全一致，否则丢弃并报错。
    pub async fn upload_chunk<R>(
        &self,
        id: &str,
        index: u64,
        reader: R,
        caller: &Owner,
    ) -> Result<Progress, UploadError>
    where
        R: AsyncRead + Unpin,
    {
        let entry = self.owned_entry(id, caller).await?;
        let (expected, final_path) = {
            let state = entry.state.lock().await;
            if state.closed {
                return Err(UploadError::NotFound);
            }
            let expected = state
                .session
                .expected_chunk_len(index)
                .ok_or(UploadError::InvalidIndex {
                    index,
                    total: state.session.total_chunks,
                })?;
            (expected, state.session.chunk_path(index))
        };

        let part_path = entry.temp_dir.join(format!(
            "{CHUNK_FILE_PREFIX}{index}.{}.part",
            Uuid::new_v4().simple()
        ));
        let written = match write_limited(&part_path, reader, expected).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&part_path).await;
                debug!(upload_id = id, chunk_index = index, error = %err, "chunk write aborted");
                return Err(err.into());
            }
        };
        if written != expected {
            let _ = fs::remove_file(&part_path).await;
            warn!(
                upload_id = id,
                chunk_index = index,
                expected,
                actual = written,
                "chunk size mismatch"
            );
            return Err(UploadError::SizeMismatch {
                expected,
                actual: written,
            });
        }

        let mut state = entry.state.lock().await;
        if state.closed {
            let _ = fs::remove_file(&part_path).await;
            return Err(UploadError::NotFound);
        }
        if let Err(err) = fs::rename(&part_path, &final_path).await {
            let _ = fs::remove_file(&part_path).await;
            return Err(err.into());
        }
        let previous_update = state.session.updated_at;
        let newly_recorded = state.session.uploaded_chunks.insert(index);
        state.session.updated_at = Utc::now();
        if let Err(err) = state.session.persist().await {
            if newly_recorded {
                state.session.uploaded_chunks.remove(&index);
            }
            state.session.updated_at = previous_update;
            warn!(upload_id = id, chunk_index = index, error = %err, "session metadata write failed");
            return Err(err.into());
        }

        let progress = state.session.progress();
        debug!(
            upload_id = id,
            chunk_index = index,
            bytes = written,
            uploaded = progress.uploaded_count,
            total = progress.total_chunks,
            "upload chunk saved"
        );
        Ok(progress)
    }

    /// 只读进度，每次根据当前状态重新计算。
    pub async fn progress(&self, id: &str) -> Result<Progress, UploadError> {
        let entry = self.live_entry(id).await?;
        let state = entry.state.lock().await;
        if state.closed {
            return Err(UploadError::NotFound);
        }
        Ok(state.session.progress())
    }

    /// 返回调用方自己的会话快照。
    pub async fn session(&self, id: &str, caller: &Owner) -> Result<UploadSession, UploadError> {
        let entry = self.owned_entry(id, caller).await?;
        let state = entry.state.lock().await;
        if state.closed {
            return Err(UploadError::NotFound);
        }
        Ok(state.session.clone())
    }

    /// 按序号升序合并全部分片到 `targetDir/filename`，无论成败都删除会话。
    pub async fn finalize(&self, id: &str, caller: &Owner) -> Result<PathBuf, UploadError> {
        let entry = self.owned_entry(id, caller).await?;
        let session = {
            let mut state = entry.state.lock().await;
            if state.closed {
                return Err(UploadError::NotFound);
            }
            if !state.session.is_complete() {
                return Err(UploadError::IncompleteUpload {
                    uploaded: state.session.uploaded_chunks.len() as u64,
                    total: state.session.total_chunks,
                });
            }
            state.closed = true;
            state.session.clone()
        };
        self.sessions.write().await.remove(id);

        let result = self.assemble(&session).await;
        remove_session_dir(&session.temp_dir).await;
        match &result {
            Ok(path) => info!(
                upload_id = id,
                path = ?path,
                total_size = session.total_size,
                "upload finalized"
            ),
            Err(err) => warn!(upload_id = id, error = %err, "upload finalize failed"),
        }
        result
    }

    async fn assemble(&self, session: &UploadSession) -> Result<PathBuf, UploadError> {
        if !is_plain_name(&session.filename) {
            return Err(UploadError::Sandbox(SandboxError::Traversal));
        }
        let target_dir = self.sandbox.resolve(&session.target_path).await?;
        self.ensure_outside_staging(target_dir.as_path())?;

        let created = missing_ancestors(target_dir.as_path()).await;
        let result = match fs::create_dir_all(target_dir.as_path()).await {
            Ok(()) => self.write_target(session, &target_dir).await,
            Err(err) => Err(err.into()),
        };
        if result.is_err() {
            remove_created_dirs(&created).await;
        }
        result
    }

    fn ensure_outside_staging(&self, path: &Path) -> Result<(), UploadError> {
        if path.starts_with(&self.staging) {
            warn!(path = ?path, "upload target inside staging area rejected");
            return Err(UploadError::Sandbox(SandboxError::Reserved));
        }
        Ok(())
    }

    async fn write_target(
        &self,
        session: &UploadSession,
        target_dir: &ResolvedPath,
    ) -> Result<PathBuf, UploadError> {
        let target = self
            .sandbox
            .resolve_entry(&format!(
                "{}/{}",
                target_dir.relative_display(),
                session.filename
            ))
            .await?;
        self.ensure_outside_staging(target.as_path())?;

        let _guard = self
            .locks
            .lock_path_with_timeout(target.as_path(), self.settings.lock_timeout)
            .await
            .map_err(|_| UploadError::Busy)?;

        let mut output = AtomicFile::create_beside(target.as_path()).await?;
        let written = match concat_chunks(session, output.file_mut()).await {
            Ok(written) => written,
            Err(err) => {
                output.cleanup().await;
                return Err(err.into());
            }
        };
        if written != session.total_size {
            warn!(
                upload_id = session.id,
                expected = session.total_size,
                actual = written,
                "size mismatch after merge"
            );
            output.cleanup().await;
            return Err(UploadError::SizeMismatch {
                expected: session.total_size,
                actual: written,
            });
        }
        output.commit().await?;

        if session.owner_uid.is_some() || session.owner_gid.is_some() {
            let mut paths = vec![target.as_path().to_path_buf()];
            if !target_dir.is_root() {
                paths.push(target_dir.as_path().to_path_buf());
            }
            apply_ownership(paths, session.owner_uid, session.owner_gid).await;
        }
        Ok(target.as_path().to_path_buf())
    }

    /// 删除调用方自己的会话及其临时目录。
    pub async fn delete_session(&self, id: &str, caller: &Owner) -> Result<(), UploadError> {
        self.owned_entry(id, caller).await?;
        self.discard(id).await;
        info!(upload_id = id, "upload session deleted");
        Ok(())
    }

    /// 列出某个所有者的全部未过期会话，按创建时间排序。
    pub async fn list_sessions_for_owner(&self, owner_id: &str) -> Vec<UploadSession> {
        let entries: Vec<Arc<SessionEntry>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.owner_id == owner_id && !entry.is_expired())
            .cloned()
            .collect();

        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            let state = entry.state.lock().await;
            if !state.closed {
                sessions.push(state.session.clone());
            }
        }
        sessions.sort_by_key(|session| session.created_at);
        sessions
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// 删除所有已过期的会话，以及临时目录中超过 TTL 且未被跟踪的残留目录。
    pub async fn sweep_expired(&self) -> io::Result<usize> {
        let expired: Vec<String> = self
            .sessions
            .read()
            .await
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        let mut removed = 0;
        for id in expired {
            if self.discard(&id).await {
                info!(upload_id = id, "expired upload session removed");
                removed += 1;
            }
        }

        let now = SystemTime::now();
        let mut dir = fs::read_dir(&self.settings.temp_root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.sessions.read().await.contains_key(&name) {
                continue;
            }
            let Ok(age) = metadata.modified().and_then(|modified| {
                now.duration_since(modified).map_err(io::Error::other)
            }) else {
                continue;
            };
            if age >= self.settings.session_ttl {
                info!(path = ?entry.path(), "removed stale upload temp dir");
                remove_session_dir(&entry.path()).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn live_entry(&self, id: &str) -> Result<Arc<SessionEntry>, UploadError> {
        let entry = self
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(UploadError::NotFound)?;
        if entry.is_expired() {
            self.discard(id).await;
            info!(upload_id = id, "expired upload session removed on access");
            return Err(UploadError::Expired);
        }
        Ok(entry)
    }

    async fn owned_entry(&self, id: &str, caller: &Owner) -> Result<Arc<SessionEntry>, UploadError> {
        let entry = self.live_entry(id).await?;
        if entry.owner_id != caller.id {
            warn!(
                upload_id = id,
                caller = caller.principal,
                "upload session accessed by non-owner"
            );
            return Err(UploadError::Forbidden);
        }
        Ok(entry)
    }

    /// 从表中移除会话并删除临时目录；会话已不存在时返回 false。
    async fn discard(&self, id: &str) -> bool {
        let Some(entry) = self.sessions.write().await.remove(id) else {
            return false;
        };
        entry.state.lock().await.closed = true;
        remove_session_dir(&entry.temp_dir).await;
        true
    }
}

async fn create_private_dir(path: &Path) -> io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(path).await
}

async fn remove_session_dir(path: &Path) {
    match fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = ?path, error = %err, "failed to remove upload temp dir"),
    }
}

/// 从深到浅列出尚不存在的目录，供合并失败时回滚。
async fn missing_ancestors(dir: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    for ancestor in dir.ancestors() {
        match fs::try_exists(ancestor).await {
            Ok(false) => missing.push(ancestor.to_path_buf()),
            _ => break,
        }
    }
    missing
}

/// 只删除空目录，其他请求在此期间写入的内容不受影响。
async fn remove_created_dirs(dirs: &[PathBuf]) {
    for dir in dirs {
        if let Err(err) = fs::remove_dir(dir).await {
            debug!(path = ?dir, error = %err, "created directory left in place");
            break;
        }
    }
}

/// 最多读取 `expected + 1` 字节，多出的那一个字节足以判定超长。
async fn write_limited<R>(path: &Path, reader: R, expected: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(path).await?;
    let mut limited = reader.take(expected + 1);
    let written = tokio::io::copy(&mut limited, &mut file).await?;
    file.sync_all().await?;
    Ok(written)
}

async fn concat_chunks(session: &UploadSession, output: &mut File) -> io::Result<u64> {
    let mut total = 0;
    for index in 0..session.total_chunks {
        let mut part = File::open(session.chunk_path(index)).await?;
        total += tokio::io::copy(&mut part, output).await?;
    }
    Ok(total)
}

/// 恢复时丢弃磁盘上缺失或长度不符的分片记录。
async fn verify_chunks(session: &mut UploadSession) {
    let mut invalid = Vec::new();
    for &index in &session.uploaded_chunks {
        let expected = session.expected_chunk_len(index);
        let actual = fs::metadata(session.chunk_path(index))
            .await
            .ok()
            .map(|metadata| metadata.len());
        if expected.is_none() || actual != expected {
            invalid.push(index);
        }
    }
    for index in invalid {
        warn!(upload_id = session.id, chunk_index = index, "recorded chunk missing on disk");
        session.uploaded_chunks.remove(&index);
    }
}

#[cfg(unix)]
async fn apply_ownership(paths: Vec<PathBuf>, uid: Option<u32>, gid: Option<u32>) {
    let result = tokio::task::spawn_blocking(move || {
        for path in &paths {
            if let Err(err) = std::os::unix::fs::chown(path, uid, gid) {
                warn!(path = ?path, uid, gid, error = %err, "failed to apply ownership");
            }
        }
    })
    .await;
    if let Err(err) = result {
        warn!(error = %err, "ownership task failed");
    }
}

#[cfg(not(unix))]
async fn apply_ownership(_paths: Vec<PathBuf>, _uid: Option<u32>, _gid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_CHUNK_SIZE, SESSION_METADATA_FILE};
    use tempfile::tempdir;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        _temp: tempfile::TempDir,
        storage_root: PathBuf,
        temp_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempdir().expect("tempdir");
        let storage_root = temp.path().join("storage");
        std::fs::create_dir_all(&storage_root).expect("create storage root");
        let temp_root = temp.path().join("uploads");
        Fixture {
            _temp: temp,
            storage_root,
            temp_root,
        }
    }

    fn settings(fixture: &Fixture, ttl: Duration) -> UploadSettings {
        UploadSettings {
            temp_root: fixture.temp_root.clone(),
            default_chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent: 0,
            session_ttl: ttl,
            lock_timeout: Duration::from_secs(5),
        }
    }

    async fn open(fixture: &Fixture, ttl: Duration) -> UploadManager {
        UploadManager::open(
            settings(fixture, ttl),
            Sandbox::new(fixture.storage_root.clone()),
        )
        .await
        .expect("open manager")
    }

    fn request(name: &str, total_size: u64, chunk_size: Option<u64>) -> NewSession {
        NewSession {
            filename: name.to_string(),
            total_size,
            target_dir: "incoming".to_string(),
            chunk_size,
            mime_type: None,
        }
    }

    fn pattern(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn chunk(data: &[u8], chunk_size: u64, index: u64) -> &[u8] {
        let start = (index * chunk_size) as usize;
        let end = ((index + 1) * chunk_size).min(data.len() as u64) as usize;
        &data[start..end]
    }

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test]
    async fn twelve_mib_upload_out_of_order() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");
        let data = pattern(12 * MIB);

        let session = manager
            .create_session(request("video.bin", data.len() as u64, None), &alice)
            .await
            .expect("create");
        assert_eq!(session.chunk_size, 5 * MIB);
        assert_eq!(session.total_chunks, 3);

        let mut seen = Vec::new();
        for index in [2, 0, 1] {
            let progress = manager
                .upload_chunk(&session.id, index, chunk(&data, 5 * MIB, index), &alice)
                .await
                .expect("upload chunk");
            seen.push((progress.uploaded_count, progress.total_chunks));
        }
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);
        assert!(manager.progress(&session.id).await.expect("progress").complete);

        let path = manager.finalize(&session.id, &alice).await.expect("finalize");
        let contents = std::fs::read(&path).expect("read result");
        assert_eq!(contents.len() as u64, 12 * MIB);
        assert!(contents == data);
        assert!(path.ends_with("incoming/video.bin"));
        assert!(!session.temp_dir.exists());
        assert!(matches!(
            manager.progress(&session.id).await,
            Err(UploadError::NotFound)
        ));
    }

    #[tokio::test]
    async fn small_chunks_reassemble_in_index_order() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");
        let data = b"0123456789abcdefghijk".to_vec();

        let session = manager
            .create_session(request("letters.txt", data.len() as u64, Some(4)), &alice)
            .await
            .expect("create");
        assert_eq!(session.total_chunks, 6);
        for index in (0..6).rev() {
            manager
                .upload_chunk(&session.id, index, chunk(&data, 4, index), &alice)
                .await
                .expect("upload chunk");
        }

        let path = manager.finalize(&session.id, &alice).await.expect("finalize");
        assert_eq!(std::fs::read(path).expect("read"), data);
    }

    #[tokio::test]
    async fn reuploading_a_chunk_is_idempotent() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");

        let session = manager
            .create_session(request("a.bin", 8, Some(4)), &alice)
            .await
            .expect("create");
        manager
            .upload_chunk(&session.id, 0, &b"abcd"[..], &alice)
            .await
            .expect("first upload");
        let progress = manager
            .upload_chunk(&session.id, 0, &b"abcd"[..], &alice)
            .await
            .expect("second upload");
        assert_eq!(progress.uploaded_count, 1);
        assert_eq!(progress.missing_chunks, vec![1]);
    }

    #[tokio::test]
    async fn other_owner_cannot_advance_or_finalize() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");
        let mallory = Owner::new("mallory");

        let session = manager
            .create_session(request("a.bin", 4, Some(4)), &alice)
            .await
            .expect("create");
        let result = manager
            .upload_chunk(&session.id, 0, &b"evil"[..], &mallory)
            .await;
        assert!(matches!(result, Err(UploadError::Forbidden)));
        assert_eq!(
            manager.progress(&session.id).await.expect("progress").uploaded_count,
            0
        );
        assert!(!session.chunk_path(0).exists());

        manager
            .upload_chunk(&session.id, 0, &b"good"[..], &alice)
            .await
            .expect("owner upload");
        let result = manager.finalize(&session.id, &mallory).await;
        assert!(matches!(result, Err(UploadError::Forbidden)));
        let result = manager.delete_session(&session.id, &mallory).await;
        assert!(matches!(result, Err(UploadError::Forbidden)));
        assert!(manager.progress(&session.id).await.expect("progress").complete);
        assert!(manager.list_sessions_for_owner("mallory").await.is_empty());
        assert_eq!(manager.list_sessions_for_owner("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn rejects_out_of_range_index() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");

        let session = manager
            .create_session(request("a.bin", 8, Some(4)), &alice)
            .await
            .expect("create");
        let result = manager
            .upload_chunk(&session.id, 2, &b"abcd"[..], &alice)
            .await;
        assert!(matches!(
            result,
            Err(UploadError::InvalidIndex { index: 2, total: 2 })
        ));
    }

    #[tokio::test]
    async fn short_or_long_chunk_is_discarded() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");

        let session = manager
            .create_session(request("a.bin", 10, Some(4)), &alice)
            .await
            .expect("create");
        let result = manager.upload_chunk(&session.id, 0, &b"abc"[..], &alice).await;
        assert!(matches!(
            result,
            Err(UploadError::SizeMismatch {
                expected: 4,
                actual: 3
            })
        ));
        let result = manager
            .upload_chunk(&session.id, 2, &b"xyz"[..], &alice)
            .await;
        assert!(matches!(
            result,
            Err(UploadError::SizeMismatch {
                expected: 2,
                actual: 3
            })
        ));

        let leftovers: Vec<_> = std::fs::read_dir(&session.temp_dir)
            .expect("read temp dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name != SESSION_METADATA_FILE)
            .collect();
        assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
        assert_eq!(
            manager.progress(&session.id).await.expect("progress").uploaded_count,
            0
        );
    }

    #[tokio::test]
    async fn finalize_requires_every_chunk() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");

        let session = manager
            .create_session(request("a.bin", 8, Some(4)), &alice)
            .await
            .expect("create");
        manager
            .upload_chunk(&session.id, 1, &b"efgh"[..], &alice)
            .await
            .expect("upload chunk");

        let result = manager.finalize(&session.id, &alice).await;
        assert!(matches!(
            result,
            Err(UploadError::IncompleteUpload {
                uploaded: 1,
                total: 2
            })
        ));
        assert!(!fixture.storage_root.join("incoming/a.bin").exists());
        assert!(session.temp_dir.exists());
        assert!(manager.progress(&session.id).await.is_ok());
    }

    #[tokio::test]
    async fn empty_upload_finalizes_to_empty_file() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");

        let session = manager
            .create_session(request("empty.txt", 0, None), &alice)
            .await
            .expect("create");
        let path = manager.finalize(&session.id, &alice).await.expect("finalize");
        assert_eq!(std::fs::metadata(path).expect("metadata").len(), 0);
    }

    #[tokio::test]
    async fn finalize_outside_root_fails_and_drops_session() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");

        let mut escape = request("a.bin", 4, Some(4));
        escape.target_dir = "../outside".to_string();
        let session = manager
            .create_session(escape, &alice)
            .await
            .expect("create");
        manager
            .upload_chunk(&session.id, 0, &b"abcd"[..], &alice)
            .await
            .expect("upload chunk");

        let result = manager.finalize(&session.id, &alice).await;
        assert!(matches!(
            result,
            Err(UploadError::Sandbox(SandboxError::Traversal))
        ));
        assert!(!session.temp_dir.exists());
        assert!(matches!(
            manager.progress(&session.id).await,
            Err(UploadError::NotFound)
        ));
    }

    #[tokio::test]
    async fn expired_session_is_unreachable_and_removed() {
        let fixture = fixture();
        let manager = open(&fixture, Duration::ZERO).await;
        let alice = Owner::new("alice");

        let session = manager
            .create_session(request("a.bin", 4, Some(4)), &alice)
            .await
            .expect("create");
        let result = manager
            .upload_chunk(&session.id, 0, &b"abcd"[..], &alice)
            .await;
        assert!(matches!(result, Err(UploadError::Expired)));
        assert!(!session.temp_dir.exists());
        assert!(matches!(
            manager.finalize(&session.id, &alice).await,
            Err(UploadError::NotFound)
        ));
    }

    #[tokio::test]
    async fn sweep_removes_expired_sessions() {
        let fixture = fixture();
        let manager = open(&fixture, Duration::ZERO).await;
        let alice = Owner::new("alice");

        let first = manager
            .create_session(request("a.bin", 4, Some(4)), &alice)
            .await
            .expect("create");
        let second = manager
            .create_session(request("b.bin", 4, Some(4)), &alice)
            .await
            .expect("create");
        assert_eq!(manager.active_sessions().await, 2);

        let removed = manager.sweep_expired().await.expect("sweep");
        assert_eq!(removed, 2);
        assert_eq!(manager.active_sessions().await, 0);
        assert!(!first.temp_dir.exists());
        assert!(!second.temp_dir.exists());
    }

    #[tokio::test]
    async fn sessions_survive_restart() {
        let fixture = fixture();
        let alice = Owner::new("alice");
        let data = b"abcdefghij".to_vec();

        let session = {
            let manager = open(&fixture, DAY).await;
            let session = manager
                .create_session(request("restart.bin", 10, Some(4)), &alice)
                .await
                .expect("create");
            manager
                .upload_chunk(&session.id, 0, chunk(&data, 4, 0), &alice)
                .await
                .expect("upload chunk");
            manager
                .upload_chunk(&session.id, 2, chunk(&data, 4, 2), &alice)
                .await
                .expect("upload chunk");
            session
        };

        let manager = open(&fixture, DAY).await;
        let progress = manager.progress(&session.id).await.expect("progress");
        assert_eq!(progress.uploaded_count, 2);
        assert_eq!(progress.missing_chunks, vec![1]);

        manager
            .upload_chunk(&session.id, 1, chunk(&data, 4, 1), &alice)
            .await
            .expect("upload chunk");
        let path = manager.finalize(&session.id, &alice).await.expect("finalize");
        assert_eq!(std::fs::read(path).expect("read"), data);
    }

    #[tokio::test]
    async fn restart_drops_expired_and_missing_chunks() {
        let fixture = fixture();
        let alice = Owner::new("alice");

        let expired = {
            let manager = open(&fixture, Duration::ZERO).await;
            manager
                .create_session(request("old.bin", 4, Some(4)), &alice)
                .await
                .expect("create")
        };
        let live = {
            let manager = open(&fixture, DAY).await;
            let session = manager
                .create_session(request("new.bin", 8, Some(4)), &alice)
                .await
                .expect("create");
            manager
                .upload_chunk(&session.id, 0, &b"abcd"[..], &alice)
                .await
                .expect("upload chunk");
            session
        };
        std::fs::remove_file(live.chunk_path(0)).expect("remove chunk");

        let manager = open(&fixture, DAY).await;
        assert!(!expired.temp_dir.exists());
        assert_eq!(manager.active_sessions().await, 1);
        let progress = manager.progress(&live.id).await.expect("progress");
        assert_eq!(progress.uploaded_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_chunks_of_one_session_all_land() {
        let fixture = fixture();
        let manager = Arc::new(open(&fixture, DAY).await);
        let alice = Owner::new("alice");
        let data = pattern(64 * 1024 + 17);
        let chunk_size = 4096;

        let session = manager
            .create_session(
                request("parallel.bin", data.len() as u64, Some(chunk_size)),
                &alice,
            )
            .await
            .expect("create");
        assert_eq!(session.total_chunks, 17);

        let mut tasks = tokio::task::JoinSet::new();
        for index in 0..session.total_chunks {
            let manager = manager.clone();
            let owner = alice.clone();
            let id = session.id.clone();
            let bytes = chunk(&data, chunk_size, index).to_vec();
            tasks.spawn(async move {
                manager
                    .upload_chunk(&id, index, std::io::Cursor::new(bytes), &owner)
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.expect("task joined").expect("upload chunk");
        }

        let progress = manager.progress(&session.id).await.expect("progress");
        assert_eq!(progress.uploaded_count, session.total_chunks);
        assert!(progress.complete);
        let persisted = UploadSession::load(&session.temp_dir).await.expect("load");
        assert_eq!(
            persisted.uploaded_chunks,
            (0..session.total_chunks).collect::<BTreeSet<_>>()
        );

        let path = manager.finalize(&session.id, &alice).await.expect("finalize");
        assert!(std::fs::read(path).expect("read") == data);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_creates_respect_session_limit() {
        let fixture = fixture();
        let mut settings = settings(&fixture, DAY);
        settings.max_concurrent = 2;
        let manager = Arc::new(
            UploadManager::open(settings, Sandbox::new(fixture.storage_root.clone()))
                .await
                .expect("open manager"),
        );

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..8 {
            let manager = manager.clone();
            tasks.spawn(async move {
                manager
                    .create_session(request(&format!("{n}.bin"), 4, None), &Owner::new("alice"))
                    .await
            });
        }
        let mut created = 0;
        while let Some(result) = tasks.join_next().await {
            match result.expect("task joined") {
                Ok(_) => created += 1,
                Err(err) => assert!(matches!(err, UploadError::TooManySessions)),
            }
        }

        assert_eq!(created, 2);
        assert_eq!(manager.active_sessions().await, 2);
        let dirs = std::fs::read_dir(&fixture.temp_root)
            .expect("read temp root")
            .filter_map(Result::ok)
            .filter(|entry| entry.path().is_dir())
            .count();
        assert_eq!(dirs, 2);
    }

    #[tokio::test]
    async fn failed_metadata_write_leaves_chunk_unrecorded() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");

        let session = manager
            .create_session(request("a.bin", 8, Some(4)), &alice)
            .await
            .expect("create");
        let metadata = session.metadata_path();
        std::fs::remove_file(&metadata).expect("remove metadata");
        std::fs::create_dir_all(metadata.join("blocker")).expect("block metadata path");

        let result = manager
            .upload_chunk(&session.id, 0, &b"abcd"[..], &alice)
            .await;
        assert!(matches!(result, Err(UploadError::Io(_))));
        let progress = manager.progress(&session.id).await.expect("progress");
        assert_eq!(progress.uploaded_count, 0);
        assert_eq!(progress.missing_chunks, vec![0, 1]);
    }

    #[tokio::test]
    async fn restart_discards_session_with_inconsistent_chunk_count() {
        let fixture = fixture();
        let alice = Owner::new("alice");

        let session = {
            let manager = open(&fixture, DAY).await;
            manager
                .create_session(request("a.bin", 10, Some(4)), &alice)
                .await
                .expect("create")
        };
        let mut tampered = UploadSession::load(&session.temp_dir).await.expect("load");
        tampered.total_chunks = 5;
        tampered.uploaded_chunks.insert(4);
        tampered.persist().await.expect("persist");

        let manager = open(&fixture, DAY).await;
        assert_eq!(manager.active_sessions().await, 0);
        assert!(!session.temp_dir.exists());
    }

    #[tokio::test]
    async fn failed_finalize_leaves_no_new_directories() {
        let fixture = fixture();
        let manager = open(&fixture, DAY).await;
        let alice = Owner::new("alice");

        let mut nested = request("a.bin", 8, Some(4));
        nested.target_dir = "fresh/deeper".to_string();
        let session = manager
            .create_session(nested, &alice)
            .await
            .expect("create");
        for (index, bytes) in [(0, &b"abcd"[..]), (1, &b"efgh"[..])] {
            manager
                .upload_chunk(&session.id, index, bytes, &alice)
                .await
                .expect("upload chunk");
        }
        std::fs::remove_file(session.chunk_path(1)).expect("remove chunk");

        let result = manager.finalize(&session.id, &alice).await;
        assert!(matches!(result, Err(UploadError::Io(_))));
        assert!(!fixture.storage_root.join("fresh").exists());
    }

    #[tokio::test]
    async fn finalize_cannot_target_staging_area_inside_root() {
        let fixture = fixture();
        let mut settings = settings(&fixture, DAY);
        settings.temp_root = fixture.storage_root.join(".uploads");
        let manager = UploadManager::open(settings, Sandbox::new(fixture.storage_root.clone()))
            .await
            .expect("open manager");
        let alice = Owner::new("alice");
        let mallory = Owner::new("mallory");

        let victim = manager
            .create_session(request("a.bin", 4, Some(4)), &alice)
            .await
            .expect("create");
        manager
            .upload_chunk(&victim.id, 0, &b"good"[..], &alice)
            .await
            .expect("upload chunk");

        let mut hijack = request(&format!("{CHUNK_FILE_PREFIX}0"), 4, Some(4));
        hijack.target_dir = format!(".uploads/{}", victim.id);
        let attack = manager
            .create_session(hijack, &mallory)
            .await
            .expect("create");
        manager
            .upload_chunk(&attack.id, 0, &b"EVIL"[..], &mallory)
            .await
            .expect("upload chunk");
        let result = manager.finalize(&attack.id, &mallory).await;
        assert!(matches!(
            result,
            Err(UploadError::Sandbox(SandboxError::Reserved))
        ));

        let path = manager.finalize(&victim.id, &alice).await.expect("finalize");
        assert_eq!(std::fs::read(path).expect("read"), b"good");
    }

    #[tokio::test]
    async fn concurrent_session_limit() {
        let fixture = fixture();
        let mut settings = settings(&fixture, DAY);
        settings.max_concurrent = 1;
        let manager = UploadManager::open(settings, Sandbox::new(fixture.storage_root.clone()))
            .await
            .expect("open manager");
        let alice = Owner::new("alice");

        manager
            .create_session(request("a.bin", 4, None), &alice)
            .await
            .expect("create");
        let result = manager
            .create_session(request("b.bin", 4, None), &alice)
            .await;
        assert!(matches!(result, Err(UploadError::TooManySessions)));
    }
}
