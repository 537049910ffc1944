//! 上传会话模型与 `session.json` 持久化。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::config::{CHUNK_FILE_PREFIX, SESSION_METADATA_FILE};

/// 调用方身份，由上游认证解析后传入，按相等性比较。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Owner {
    pub id: String,
    pub principal: String,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Owner {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            principal: id.clone(),
            id,
            uid: None,
            gid: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: String,
    pub filename: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    #[serde(default)]
    pub uploaded_chunks: BTreeSet<u64>,
    pub target_path: String,
    pub temp_dir: PathBuf,
    pub owner_id: String,
    #[serde(default)]
    pub owner_principal: String,
    #[serde(default)]
    pub owner_uid: Option<u32>,
    #[serde(default)]
    pub owner_gid: Option<u32>,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub uploaded_count: u64,
    pub total_chunks: u64,
    pub percent_complete: f64,
    pub complete: bool,
    pub missing_chunks: Vec<u64>,
}

/// `ceil(total_size / chunk_size)`，空文件为 0 个分片。
pub fn total_chunks_for(total_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    total_size.div_ceil(chunk_size)
}

impl UploadSession {
    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() as u64 == self.total_chunks
    }

    /// 分片数与大小是否自洽；从磁盘加载的元数据需要先通过此检查。
    pub fn is_consistent(&self) -> bool {
        self.chunk_size > 0
            && self.total_chunks == total_chunks_for(self.total_size, self.chunk_size)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 指定分片应有的字节数：末片为余数，其余为 `chunk_size`。
    pub fn expected_chunk_len(&self, index: u64) -> Option<u64> {
        if index >= self.total_chunks {
            return None;
        }
        if index + 1 == self.total_chunks {
            return Some(self.total_size - self.chunk_size * index);
        }
        Some(self.chunk_size)
    }

    pub fn missing_chunks(&self) -> Vec<u64> {
        (0..self.total_chunks)
            .filter(|index| !self.uploaded_chunks.contains(index))
            .collect()
    }

    pub fn progress(&self) -> Progress {
        let uploaded_count = self.uploaded_chunks.len() as u64;
        let percent_complete = if self.total_chunks == 0 {
            100.0
        } else {
            uploaded_count as f64 * 100.0 / self.total_chunks as f64
        };
        Progress {
            uploaded_count,
            total_chunks: self.total_chunks,
            percent_complete,
            complete: self.is_complete(),
            missing_chunks: self.missing_chunks(),
        }
    }

    pub fn chunk_path(&self, index: u64) -> PathBuf {
        chunk_path(&self.temp_dir, index)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.temp_dir.join(SESSION_METADATA_FILE)
    }

    /// 写入完整会话元数据：先写临时文件再改名，避免崩溃时留下半截 JSON。
    pub async fn persist(&self) -> io::Result<()> {
        let content = serde_json::to_vec(self).map_err(io::Error::other)?;
        let temp_path = self.temp_dir.join(format!("{SESSION_METADATA_FILE}.tmp"));
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, self.metadata_path()).await
    }

    /// 从会话目录读取元数据，`temp_dir` 以实际所在目录为准。
    pub async fn load(dir: &Path) -> io::Result<Self> {
        let content = fs::read(dir.join(SESSION_METADATA_FILE)).await?;
        let mut session: UploadSession = serde_json::from_slice(&content)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        session.temp_dir = dir.to_path_buf();
        Ok(session)
    }
}

fn chunk_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{CHUNK_FILE_PREFIX}{index}"))
}
