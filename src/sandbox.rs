//! 路径沙箱：把 (root, 相对路径) 解析为受限的绝对路径，拒绝 `..` 与符号链接逃逸。

use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::config::{MAX_COMPONENT_LEN, MAX_PATH_LEN};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path escapes its root")]
    Traversal,
    #[error("path contains a NUL byte")]
    NulByte,
    #[error("path component exceeds {} bytes", MAX_COMPONENT_LEN)]
    ComponentTooLong,
    #[error("path exceeds {} bytes", MAX_PATH_LEN)]
    PathTooLong,
    #[error("operation not permitted on the root directory")]
    RootOperation,
    #[error("path is reserved for upload staging")]
    Reserved,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 经过沙箱校验的路径，只能由 [`resolve`] / [`resolve_entry`] 构造。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    root: PathBuf,
    path: PathBuf,
}

impl ResolvedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// 相对根目录的路径，根目录本身为空路径。
    pub fn relative(&self) -> &Path {
        self.path.strip_prefix(&self.root).unwrap_or(Path::new(""))
    }

    /// 以 `/` 分隔的相对路径，用于 API 响应。
    pub fn relative_display(&self) -> String {
        self.relative()
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/")
    }

    pub fn is_root(&self) -> bool {
        self.path == self.root
    }

    pub fn file_name(&self) -> Option<&OsStr> {
        if self.is_root() {
            return None;
        }
        self.path.file_name()
    }

    /// 拒绝对根目录执行删除或移动。
    pub fn ensure_not_root(&self) -> Result<(), SandboxError> {
        if self.is_root() {
            return Err(SandboxError::RootOperation);
        }
        Ok(())
    }
}

impl AsRef<Path> for ResolvedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// 解析 `root` 下的 `requested`，跟随符号链接后仍须落在根目录内。
///
/// 末尾尚不存在的路径段允许保留（用于新建文件或目录），但路径上任何悬空的
/// 符号链接都会被拒绝，否则后续创建操作可能穿过它写到根目录之外。
pub fn resolve(root: &Path, requested: &str) -> Result<ResolvedPath, SandboxError> {
    let (clean_root, clean_full) = clean_pair(root, requested)?;
    let resolved_root = clean_root.canonicalize()?;
    let resolved = canonicalize_existing(&clean_full)?;
    if !resolved.starts_with(&resolved_root) {
        return Err(SandboxError::Traversal);
    }
    Ok(ResolvedPath {
        root: resolved_root,
        path: resolved,
    })
}

/// 只解析父目录，保留最后一个路径段本身（符号链接不被跟随）。
///
/// 删除、重命名与上传落盘都作用于目录项本身，而不是链接指向的目标。
pub fn resolve_entry(root: &Path, requested: &str) -> Result<ResolvedPath, SandboxError> {
    let (clean_root, clean_full) = clean_pair(root, requested)?;
    if clean_full == clean_root {
        return Err(SandboxError::RootOperation);
    }
    let (Some(parent), Some(name)) = (clean_full.parent(), clean_full.file_name()) else {
        return Err(SandboxError::Traversal);
    };
    let resolved_root = clean_root.canonicalize()?;
    let resolved_parent = canonicalize_existing(parent)?;
    if !resolved_parent.starts_with(&resolved_root) {
        return Err(SandboxError::Traversal);
    }
    Ok(ResolvedPath {
        root: resolved_root,
        path: resolved_parent.join(name),
    })
}

/// 单个文件名：非空、不含分隔符与 NUL、不是 `.` 或 `..`。
pub fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name.len() <= MAX_COMPONENT_LEN
        && !name.contains(['/', '\\', '\0'])
}

fn clean_pair(root: &Path, requested: &str) -> Result<(PathBuf, PathBuf), SandboxError> {
    check_request(requested)?;
    let clean_root = lexical_clean(&std::path::absolute(root)?);
    let trimmed = requested.trim_start_matches(['/', '\\']);
    let relative = Path::new(trimmed);
    if relative
        .components()
        .any(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
    {
        return Err(SandboxError::Traversal);
    }
    let clean_full = lexical_clean(&clean_root.join(relative));
    if !clean_full.starts_with(&clean_root) {
        return Err(SandboxError::Traversal);
    }
    Ok((clean_root, clean_full))
}

fn check_request(requested: &str) -> Result<(), SandboxError> {
    if requested.contains('\0') {
        return Err(SandboxError::NulByte);
    }
    if requested.len() > MAX_PATH_LEN {
        return Err(SandboxError::PathTooLong);
    }
    if requested
        .split(['/', '\\'])
        .any(|segment| segment.len() > MAX_COMPONENT_LEN)
    {
        return Err(SandboxError::ComponentTooLong);
    }
    Ok(())
}

/// 纯词法规整：折叠 `.` 与 `..`，不访问文件系统。
fn lexical_clean(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// 规范化最长的已存在前缀，再拼回尚不存在的尾部。
fn canonicalize_existing(path: &Path) -> Result<PathBuf, SandboxError> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(mut resolved) => {
                for name in missing.iter().rev() {
                    resolved.push(name);
                }
                return Ok(resolved);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // 目录项存在但无法规范化：悬空的符号链接。
                if std::fs::symlink_metadata(&existing).is_ok() {
                    return Err(SandboxError::Traversal);
                }
                let Some(name) = existing.file_name().map(OsStr::to_os_string) else {
                    return Err(SandboxError::Io(err));
                };
                missing.push(name);
                if !existing.pop() {
                    return Err(SandboxError::Io(err));
                }
            }
            Err(err) => return Err(SandboxError::Io(err)),
        }
    }
}

/// 绑定到固定根目录的沙箱，供异步处理器使用。
#[derive(Clone, Debug)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub async fn resolve(&self, requested: &str) -> Result<ResolvedPath, SandboxError> {
        let root = self.root.clone();
        let requested = requested.to_string();
        tokio::task::spawn_blocking(move || resolve(&root, &requested))
            .await
            .map_err(|err| SandboxError::Io(io::Error::other(err.to_string())))?
    }

    pub async fn resolve_entry(&self, requested: &str) -> Result<ResolvedPath, SandboxError> {
        let root = self.root.clone();
        let requested = requested.to_string();
        tokio::task::spawn_blocking(move || resolve_entry(&root, &requested))
            .await
            .map_err(|err| SandboxError::Io(io::Error::other(err.to_string())))?
    }
}
