//! 上传前置校验：大小上限、扩展名与 MIME 类型的允许/拒绝列表。

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file size {size} exceeds limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },
    #[error("file extension is denied: {0}")]
    ExtensionDenied(String),
    #[error("file extension is not allowed: {0}")]
    ExtensionNotAllowed(String),
    #[error("content type is denied: {0}")]
    MimeDenied(String),
    #[error("content type is not allowed: {0}")]
    MimeNotAllowed(String),
}

/// 上传策略。拒绝列表优先；非空允许列表是排他的；比较不区分大小写。
#[derive(Debug, Clone, Default)]
pub struct UploadPolicy {
    /// 0 表示不限制。
    pub max_size: u64,
    pub allowed_extensions: Vec<String>,
    pub denied_extensions: Vec<String>,
    pub allowed_mime_types: Vec<String>,
    pub denied_mime_types: Vec<String>,
}

impl UploadPolicy {
    pub fn new(
        max_size: u64,
        allowed_extensions: &[String],
        denied_extensions: &[String],
        allowed_mime_types: &[String],
        denied_mime_types: &[String],
    ) -> Self {
        Self {
            max_size,
            allowed_extensions: normalize_extensions(allowed_extensions),
            denied_extensions: normalize_extensions(denied_extensions),
            allowed_mime_types: normalize_list(allowed_mime_types),
            denied_mime_types: normalize_list(denied_mime_types),
        }
    }

    /// 在写入任何字节之前校验上传请求。
    pub fn validate(
        &self,
        filename: &str,
        size: u64,
        mime_type: Option<&str>,
    ) -> Result<(), ValidationError> {
        if self.max_size > 0 && size > self.max_size {
            return Err(ValidationError::TooLarge {
                size,
                max: self.max_size,
            });
        }

        let extension = extension_of(filename);
        if let Some(ext) = &extension
            && self.denied_extensions.contains(ext)
        {
            return Err(ValidationError::ExtensionDenied(ext.clone()));
        }
        if !self.allowed_extensions.is_empty() {
            let allowed = extension
                .as_ref()
                .is_some_and(|ext| self.allowed_extensions.contains(ext));
            if !allowed {
                return Err(ValidationError::ExtensionNotAllowed(
                    extension.unwrap_or_default(),
                ));
            }
        }

        let mime = mime_type
            .map(|value| value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                mime_guess::from_path(filename)
                    .first()
                    .map(|mime| mime.essence_str().to_string())
            });
        if let Some(mime) = &mime
            && self.denied_mime_types.iter().any(|p| mime_matches(p, mime))
        {
            return Err(ValidationError::MimeDenied(mime.clone()));
        }
        if !self.allowed_mime_types.is_empty() {
            let allowed = mime
                .as_deref()
                .is_some_and(|mime| self.allowed_mime_types.iter().any(|p| mime_matches(p, mime)));
            if !allowed {
                return Err(ValidationError::MimeNotAllowed(mime.unwrap_or_default()));
            }
        }
        Ok(())
    }
}

fn normalize_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|value| value.trim().to_ascii_lowercase())
        .filter(|value| !value.is_empty())
        .collect()
}

fn normalize_extensions(values: &[String]) -> Vec<String> {
    normalize_list(values)
        .into_iter()
        .map(|value| value.trim_start_matches('.').to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn extension_of(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// 支持 `type/*` 通配。
fn mime_matches(pattern: &str, mime: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(prefix) => mime
            .split_once('/')
            .is_some_and(|(kind, _)| kind == prefix),
        None => pattern == mime,
    }
}
