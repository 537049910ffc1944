//! HTTPS 证书加载；未提供证书时生成自签名证书。

use axum_server::tls_rustls::RustlsConfig;
use rcgen::generate_simple_self_signed;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

use crate::config::Args;

/// 构建 Rustls 配置（必要时生成自签名证书）。
pub async fn build_rustls_config(args: &Args, host: IpAddr) -> io::Result<RustlsConfig> {
    let (cert_path, key_path) = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => (PathBuf::from(cert), PathBuf::from(key)),
        (Some(_), None) | (None, Some(_)) => {
            warn!("both --tls-cert and --tls-key are required, falling back to self-signed");
            generate_self_signed_paths(host)?
        }
        (None, None) => generate_self_signed_paths(host)?,
    };

    let cert = fs::read(&cert_path).await?;
    let key = fs::read(&key_path).await?;
    RustlsConfig::from_pem(cert, key).await
}

/// 生成自签名证书并返回文件路径。
fn generate_self_signed_paths(host: IpAddr) -> io::Result<(PathBuf, PathBuf)> {
    let names = vec![host.to_string(), "localhost".to_string()];
    let cert = generate_simple_self_signed(names).map_err(|err| io::Error::other(err.to_string()))?;
    let cert_path = std::env::temp_dir().join("dockyard-cert.pem");
    let key_path = std::env::temp_dir().join("dockyard-key.pem");
    std::fs::write(&cert_path, cert.cert.pem())?;
    std::fs::write(&key_path, cert.key_pair.serialize_pem())?;
    info!(cert = ?cert_path, "generated self-signed certificate");
    Ok((cert_path, key_path))
}
