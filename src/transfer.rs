//! 文件下载：Range（单段与 multipart/byteranges）、条件缓存与内容类型推断。

use axum::body::{Body as AxumBody, Bytes};
use axum::http::header::InvalidHeaderValue;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use httpdate::fmt_http_date;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::config::MAX_RANGES;
use crate::etag::{etag_from_metadata, if_range_allows, is_not_modified};
use crate::sandbox::ResolvedPath;

const SNIFF_LEN: u64 = 512;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("path is a directory")]
    IsDirectory,
    #[error("range not satisfiable for {0} bytes")]
    RangeNotSatisfiable(u64),
    #[error("invalid response header: {0}")]
    Header(#[from] InvalidHeaderValue),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 闭区间字节范围，满足 `start <= end < size`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeRequest {
    /// 无法识别的单位或范围过多：按完整文件响应。
    Full,
    Partial(Vec<ByteRange>),
    Unsatisfiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

/// 解析 `Range` 头；无效或越界的单个范围被丢弃，全部丢弃时不可满足。
pub fn parse_range(value: &str, size: u64) -> RangeRequest {
    let Some((unit, specs)) = value.trim().split_once('=') else {
        return RangeRequest::Full;
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return RangeRequest::Full;
    }

    let ranges: Vec<ByteRange> = specs
        .split(',')
        .map(str::trim)
        .filter(|spec| !spec.is_empty())
        .filter_map(|spec| parse_spec(spec, size))
        .collect();
    if ranges.is_empty() {
        RangeRequest::Unsatisfiable
    } else if ranges.len() > MAX_RANGES {
        RangeRequest::Full
    } else {
        RangeRequest::Partial(ranges)
    }
}

fn parse_spec(spec: &str, size: u64) -> Option<ByteRange> {
    let (start, end) = spec.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());
    if size == 0 {
        return None;
    }
    if start.is_empty() {
        let suffix = parse_digits(end)?;
        if suffix == 0 {
            return None;
        }
        return Some(ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        });
    }

    let start = parse_digits(start)?;
    if start >= size {
        return None;
    }
    let end = if end.is_empty() {
        size - 1
    } else {
        let end = parse_digits(end)?;
        if end < start {
            return None;
        }
        end.min(size - 1)
    };
    Some(ByteRange { start, end })
}

fn parse_digits(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse().ok()
}

/// 生成 `Content-Disposition`，非 ASCII 文件名额外附带 RFC 5987 `filename*`。
pub fn content_disposition(disposition: Disposition, filename: &str) -> String {
    let kind = match disposition {
        Disposition::Inline => "inline",
        Disposition::Attachment => "attachment",
    };
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if filename.is_ascii() {
        return format!("{kind}; filename=\"{fallback}\"");
    }
    let encoded = utf8_percent_encode(filename, NON_ALPHANUMERIC);
    format!("{kind}; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}

/// 按文件头字节推断内容类型，用于扩展名无法识别的情况。
pub fn sniff_content_type(head: &[u8]) -> &'static str {
    if let Some(kind) = infer::get(head) {
        return kind.mime_type();
    }
    let binary = head
        .iter()
        .any(|&b| matches!(b, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f));
    let utf8 = match std::str::from_utf8(head) {
        Ok(_) => true,
        // 截断在多字节字符中间时仍视为文本。
        Err(err) => err.error_len().is_none(),
    };
    if !binary && utf8 {
        "text/plain; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

async fn detect_content_type(path: &Path, file: &mut File) -> io::Result<String> {
    if let Some(mime) = mime_guess::from_path(path).first() {
        return Ok(mime.essence_str().to_string());
    }
    let mut head = Vec::with_capacity(SNIFF_LEN as usize);
    (&mut *file).take(SNIFF_LEN).read_to_end(&mut head).await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok(sniff_content_type(&head).to_string())
}

fn header_value(value: &str) -> Result<HeaderValue, TransferError> {
    Ok(HeaderValue::from_str(value)?)
}

/// 以 HTTP 响应提供已通过沙箱校验的文件。
pub async fn serve_file(
    target: &ResolvedPath,
    request_headers: &HeaderMap,
    disposition: Disposition,
) -> Result<Response, TransferError> {
    let path = target.as_path();
    let mut file = File::open(path).await?;
    let metadata = file.metadata().await?;
    if metadata.is_dir() {
        return Err(TransferError::IsDirectory);
    }
    let size = metadata.len();
    let modified = metadata.modified().ok();
    let etag = etag_from_metadata(&metadata);
    let filename = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());

    let mut response_headers = HeaderMap::new();
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response_headers.insert(header::ETAG, header_value(&etag)?);
    if let Some(modified) = modified {
        response_headers.insert(header::LAST_MODIFIED, header_value(&fmt_http_date(modified))?);
    }

    if is_not_modified(request_headers, &etag, modified) {
        debug!(path = ?path, "download not modified");
        return Ok((StatusCode::NOT_MODIFIED, response_headers).into_response());
    }

    let content_type = detect_content_type(path, &mut file).await?;
    response_headers.insert(header::CONTENT_TYPE, header_value(&content_type)?);
    response_headers.insert(
        header::CONTENT_DISPOSITION,
        header_value(&content_disposition(disposition, &filename))?,
    );

    let range = match request_headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
    {
        Some(value) if if_range_allows(request_headers, &etag, modified) => {
            parse_range(value, size)
        }
        _ => RangeRequest::Full,
    };

    match range {
        RangeRequest::Unsatisfiable => Err(TransferError::RangeNotSatisfiable(size)),
        RangeRequest::Full => {
            response_headers.insert(header::CONTENT_LENGTH, header_value(&size.to_string())?);
            debug!(path = ?path, size, "download full file");
            Ok((
                StatusCode::OK,
                response_headers,
                AxumBody::from_stream(ReaderStream::new(file)),
            )
                .into_response())
        }
        RangeRequest::Partial(ranges) if ranges.len() == 1 => {
            let range = ranges[0];
            file.seek(SeekFrom::Start(range.start)).await?;
            response_headers.insert(
                header::CONTENT_RANGE,
                header_value(&range.content_range(size))?,
            );
            response_headers.insert(
                header::CONTENT_LENGTH,
                header_value(&range.length().to_string())?,
            );
            debug!(
                path = ?path,
                start = range.start,
                end = range.end,
                "download range request accepted"
            );
            Ok((
                StatusCode::PARTIAL_CONTENT,
                response_headers,
                AxumBody::from_stream(ReaderStream::new(file.take(range.length()))),
            )
                .into_response())
        }
        RangeRequest::Partial(ranges) => {
            drop(file);
            let boundary = Uuid::new_v4().simple().to_string();
            let (length, body) =
                multipart_body(path.to_path_buf(), &ranges, size, &content_type, &boundary);
            response_headers.insert(
                header::CONTENT_TYPE,
                header_value(&format!("multipart/byteranges; boundary={boundary}"))?,
            );
            response_headers.insert(header::CONTENT_LENGTH, header_value(&length.to_string())?);
            debug!(path = ?path, parts = ranges.len(), "download multi-range request accepted");
            Ok((StatusCode::PARTIAL_CONTENT, response_headers, body).into_response())
        }
    }
}

/// 构造 multipart/byteranges 响应体，并返回精确的总长度。
fn multipart_body(
    path: PathBuf,
    ranges: &[ByteRange],
    size: u64,
    content_type: &str,
    boundary: &str,
) -> (u64, AxumBody) {
    let mut length = 0u64;
    let mut parts: Vec<BoxStream<'static, io::Result<Bytes>>> = Vec::new();
    for &range in ranges {
        let head = format!(
            "\r\n--{boundary}\r\nContent-Type: {content_type}\r\nContent-Range: {}\r\n\r\n",
            range.content_range(size)
        );
        length += head.len() as u64 + range.length();
        parts.push(stream::once(async move { Ok::<_, io::Error>(Bytes::from(head)) }).boxed());

        let path = path.clone();
        parts.push(
            stream::once(async move { open_section(path, range).await })
                .try_flatten()
                .boxed(),
        );
    }
    let tail = format!("\r\n--{boundary}--\r\n");
    length += tail.len() as u64;
    parts.push(stream::once(async move { Ok::<_, io::Error>(Bytes::from(tail)) }).boxed());

    (length, AxumBody::from_stream(stream::iter(parts).flatten()))
}

async fn open_section(
    path: PathBuf,
    range: ByteRange,
) -> io::Result<ReaderStream<tokio::io::Take<File>>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    Ok(ReaderStream::new(file.take(range.length())))
}
