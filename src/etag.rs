//! ETag 计算与条件请求判定（If-None-Match / If-Modified-Since / If-Range）。

use axum::http::{HeaderMap, header};
use httpdate::parse_http_date;
use std::fs::Metadata;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 由修改时间与大小生成 ETag，不读取文件内容。
pub fn etag_from_metadata(metadata: &Metadata) -> String {
    let size = metadata.len();
    match metadata
        .modified()
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
    {
        Some(duration) => format!("\"{:x}-{:x}\"", duration.as_secs(), size),
        None => format!("\"{:x}\"", size),
    }
}

/// HTTP 日期只有秒级精度，比较前截断亚秒部分。
fn truncate_to_secs(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(duration) => UNIX_EPOCH + Duration::from_secs(duration.as_secs()),
        Err(_) => time,
    }
}

/// 判断是否应返回 304。存在 If-None-Match 时忽略 If-Modified-Since。
pub fn is_not_modified(
    headers: &HeaderMap,
    current_etag: &str,
    last_modified: Option<SystemTime>,
) -> bool {
    if let Some(value) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        return value.trim() == "*" || etag_matches(value, current_etag, false);
    }

    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_http_date(v).ok())
    else {
        return false;
    };
    match last_modified {
        Some(modified) => truncate_to_secs(modified) <= since,
        None => false,
    }
}

/// If-Range 校验：不匹配时应忽略 Range，返回完整内容。
pub fn if_range_allows(
    headers: &HeaderMap,
    current_etag: &str,
    last_modified: Option<SystemTime>,
) -> bool {
    let Some(value) = headers.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let value = value.trim();
    if value.starts_with('"') || value.starts_with("W/") {
        return etag_matches(value, current_etag, true);
    }
    match (parse_http_date(value), last_modified) {
        (Ok(date), Some(modified)) => truncate_to_secs(modified) == date,
        _ => false,
    }
}

/// 在逗号分隔的 ETag 列表中查找；弱比较时忽略 `W/` 前缀。
fn etag_matches(header_value: &str, current: &str, strong: bool) -> bool {
    let current_opaque = current.trim_start_matches("W/");
    header_value.split(',').map(str::trim).any(|item| {
        if strong {
            !item.starts_with("W/") && !current.starts_with("W/") && item == current
        } else {
            item.trim_start_matches("W/") == current_opaque
        }
    })
}
