//! 共享目录的列表、删除、建目录与重命名，所有路径都经过沙箱解析。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs::{FileType, Metadata};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::config::DEFAULT_LIST_LIMIT;
use crate::ownership::OwnershipCache;
use crate::sandbox::{ResolvedPath, Sandbox, SandboxError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("not a directory")]
    NotADirectory,
    #[error("target already exists")]
    AlreadyExists,
    #[error("cannot move a directory into itself")]
    InvalidTarget,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Name,
    Size,
    Modified,
    Owner,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug)]
pub struct ListOptions {
    pub sort: SortKey,
    pub order: SortOrder,
    pub offset: usize,
    pub limit: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            sort: SortKey::Name,
            order: SortOrder::Asc,
            offset: 0,
            limit: DEFAULT_LIST_LIMIT,
        }
    }
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: Option<String>,
    #[serde(skip)]
    modified_at: Option<Duration>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub path: String,
    pub total: usize,
    pub offset: usize,
    pub entries: Vec<FileEntry>,
}

/// 目录枚举阶段即可得到的信息，不需要额外 stat。
struct DirItem {
    name: String,
    path: PathBuf,
    file_type: FileType,
}

impl DirItem {
    fn is_dir(&self) -> bool {
        self.file_type.is_dir()
    }
}

#[derive(Clone)]
pub struct Storage {
    sandbox: Sandbox,
    ownership: Arc<OwnershipCache>,
    hidden: Option<PathBuf>,
}

impl Storage {
    pub fn new(sandbox: Sandbox, ownership: Arc<OwnershipCache>) -> Self {
        Self {
            sandbox,
            ownership,
            hidden: None,
        }
    }

    /// 保留指定目录（位于存储根目录内的上传临时目录）：列表中隐藏，
    /// 其本身及其内部的任何路径都不能通过文件接口访问。
    pub fn with_hidden(mut self, path: PathBuf) -> Self {
        self.hidden = Some(path);
        self
    }

    #[cfg(test)]
    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    /// 解析并跟随符号链接，拒绝落入保留目录的路径。
    pub async fn resolve(&self, relative: &str) -> Result<ResolvedPath, StorageError> {
        let resolved = self.sandbox.resolve(relative).await?;
        self.ensure_visible(&resolved)?;
        Ok(resolved)
    }

    async fn resolve_entry(&self, relative: &str) -> Result<ResolvedPath, StorageError> {
        let resolved = self.sandbox.resolve_entry(relative).await?;
        self.ensure_visible(&resolved)?;
        Ok(resolved)
    }

    fn ensure_visible(&self, path: &ResolvedPath) -> Result<(), SandboxError> {
        match &self.hidden {
            Some(hidden) if path.as_path().starts_with(hidden) => Err(SandboxError::Reserved),
            _ => Ok(()),
        }
    }

    /// 列出目录内容并分页。
    ///
    /// 按名称排序时只依赖目录枚举返回的文件类型，先排序分页，再对当前页
    /// 逐项 stat；其他排序键必须先 stat 全部条目。
    pub async fn list_dir(
        &self,
        relative: Option<&str>,
        options: &ListOptions,
    ) -> Result<Listing, StorageError> {
        let dir = self.resolve(relative.unwrap_or("")).await?;
        if !fs::metadata(dir.as_path()).await?.is_dir() {
            return Err(StorageError::NotADirectory);
        }

        let mut reader = fs::read_dir(dir.as_path()).await?;
        let mut items = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if self.hidden.as_deref() == Some(path.as_path()) {
                continue;
            }
            items.push(DirItem {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                file_type: entry.file_type().await?,
            });
        }
        let total = items.len();
        let descending = options.order == SortOrder::Desc;

        let entries = if options.sort == SortKey::Name {
            items.sort_by(|a, b| {
                dirs_first(a.is_dir(), b.is_dir())
                    .then_with(|| directed(compare_names(&a.name, &b.name), descending))
            });
            let mut entries = Vec::new();
            for item in paginate(items, options.offset, options.limit) {
                if let Some(entry) = self.stat_entry(&dir, item).await {
                    entries.push(entry);
                }
            }
            entries
        } else {
            let mut entries = Vec::with_capacity(items.len());
            for item in items {
                if let Some(entry) = self.stat_entry(&dir, item).await {
                    entries.push(entry);
                }
            }
            entries.sort_by(|a, b| {
                dirs_first(a.is_dir, b.is_dir).then_with(|| {
                    let primary = match options.sort {
                        SortKey::Size => a.size.cmp(&b.size),
                        SortKey::Modified => a.modified_at.cmp(&b.modified_at),
                        SortKey::Owner => a.owner.cmp(&b.owner),
                        SortKey::Name => Ordering::Equal,
                    };
                    directed(
                        primary.then_with(|| compare_names(&a.name, &b.name)),
                        descending,
                    )
                })
            });
            paginate(entries, options.offset, options.limit)
        };

        debug!(
            path = dir.relative_display(),
            total,
            returned = entries.len(),
            "directory listed"
        );
        Ok(Listing {
            path: dir.relative_display(),
            total,
            offset: options.offset,
            entries,
        })
    }

    async fn stat_entry(&self, dir: &ResolvedPath, item: DirItem) -> Option<FileEntry> {
        // 枚举与 stat 之间条目可能已被删除，跳过即可。
        let metadata = match fs::symlink_metadata(&item.path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(path = ?item.path, error = %err, "skip vanished entry");
                return None;
            }
        };
        let relative = dir.relative().join(&item.name);
        let modified_at = metadata
            .modified()
            .ok()
            .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok());
        let (mode, uid, gid) = unix_attributes(&metadata);
        Some(FileEntry {
            path: relative
                .to_string_lossy()
                .replace(std::path::MAIN_SEPARATOR, "/"),
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            size: metadata.len(),
            modified: modified_at.map(format_timestamp),
            modified_at,
            mode,
            uid,
            gid,
            owner: uid.map(|uid| self.ownership.username_for(uid)),
            group: gid.map(|gid| self.ownership.groupname_for(gid)),
            name: item.name,
        })
    }

    /// 删除文件或目录；符号链接只删除链接本身，根目录不可删除。
    pub async fn delete_path(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_entry(relative).await?;
        target.ensure_not_root()?;
        let metadata = fs::symlink_metadata(target.as_path()).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(target.as_path()).await?;
        } else {
            fs::remove_file(target.as_path()).await?;
        }
        Ok(())
    }

    pub async fn create_dir(&self, relative: &str) -> Result<ResolvedPath, StorageError> {
        let target = self.resolve(relative).await?;
        fs::create_dir_all(target.as_path()).await?;
        Ok(target)
    }

    /// 在根目录内移动或重命名条目，目标已存在时拒绝。
    pub async fn rename_path(&self, from: &str, to: &str) -> Result<ResolvedPath, StorageError> {
        let source = self.resolve_entry(from).await?;
        let target = self.resolve_entry(to).await?;
        source.ensure_not_root()?;
        target.ensure_not_root()?;

        let metadata = fs::symlink_metadata(source.as_path()).await?;
        if metadata.is_dir() && target.as_path().starts_with(source.as_path()) {
            return Err(StorageError::InvalidTarget);
        }
        match fs::symlink_metadata(target.as_path()).await {
            Ok(_) => return Err(StorageError::AlreadyExists),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(StorageError::Io(err)),
        }
        fs::rename(source.as_path(), target.as_path()).await?;
        Ok(target)
    }
}

fn dirs_first(a_dir: bool, b_dir: bool) -> Ordering {
    match (a_dir, b_dir) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

fn directed(ordering: Ordering, descending: bool) -> Ordering {
    if descending {
        ordering.reverse()
    } else {
        ordering
    }
}

fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

#[cfg(unix)]
fn unix_attributes(metadata: &Metadata) -> (Option<u32>, Option<u32>, Option<u32>) {
    use std::os::unix::fs::MetadataExt;
    (
        Some(metadata.mode()),
        Some(metadata.uid()),
        Some(metadata.gid()),
    )
}

#[cfg(not(unix))]
fn unix_attributes(_metadata: &Metadata) -> (Option<u32>, Option<u32>, Option<u32>) {
    (None, None, None)
}

fn format_timestamp(duration: Duration) -> String {
    let timestamp = UNIX_EPOCH + duration;
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}
