//! axum 请求处理器。

pub mod files;
pub mod upload;
