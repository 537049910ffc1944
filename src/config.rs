//! CLI arguments and server configuration defaults.

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const SESSION_METADATA_FILE: &str = "session.json";
pub const CHUNK_FILE_PREFIX: &str = "chunk_";
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 65536;
pub const DEFAULT_UPLOAD_MAX_CONCURRENT: u64 = 64;
pub const DEFAULT_UPLOAD_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_UPLOAD_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_OWNER_REFRESH_INTERVAL_SECS: u64 = 5 * 60;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PASSWD_FILE: &str = "/etc/passwd";
pub const DEFAULT_GROUP_FILE: &str = "/etc/group";
pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_COMPONENT_LEN: usize = 255;
pub const MAX_RANGES: usize = 64;
pub const DEFAULT_LIST_LIMIT: usize = 1000;

pub const IDENTITY_ID_HEADER: &str = "x-remote-id";
pub const IDENTITY_PRINCIPAL_HEADER: &str = "x-remote-user";
pub const IDENTITY_UID_HEADER: &str = "x-remote-uid";
pub const IDENTITY_GID_HEADER: &str = "x-remote-gid";

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "dockyard", version = VERSION_INFO, about = "Dockyard transfer server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "DOCKYARD_STORAGE_DIR",
        default_value = ".dockyard/storage",
        help = "Root directory of the shared tree"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "DOCKYARD_UPLOAD_TEMP_DIR",
        default_value = ".dockyard/uploads",
        help = "Scratch directory for in-flight upload sessions"
    )]
    pub upload_temp_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "DOCKYARD_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "DOCKYARD_HTTP_PORT",
        default_value_t = 5080,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "DOCKYARD_HTTPS_PORT",
        help = "HTTPS port (HTTPS disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "DOCKYARD_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "DOCKYARD_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "DOCKYARD_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "DOCKYARD_UPLOAD_CHUNK_SIZE",
        default_value_t = DEFAULT_CHUNK_SIZE,
        help = "Default chunk size in bytes for new upload sessions"
    )]
    pub upload_chunk_size: u64,
    #[arg(
        long,
        env = "DOCKYARD_UPLOAD_MAX_CHUNK_SIZE",
        default_value_t = MAX_CHUNK_SIZE,
        help = "Largest chunk size a client may request"
    )]
    pub upload_max_chunk_size: u64,
    #[arg(
        long,
        env = "DOCKYARD_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload total size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "DOCKYARD_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload (0 to disable)"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "DOCKYARD_UPLOAD_MAX_CONCURRENT",
        default_value_t = DEFAULT_UPLOAD_MAX_CONCURRENT,
        help = "Max concurrent upload sessions (0 to disable)"
    )]
    pub upload_max_concurrent: u64,
    #[arg(
        long,
        env = "DOCKYARD_UPLOAD_SESSION_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_SESSION_TTL_SECS,
        help = "Upload session lifetime in seconds"
    )]
    pub upload_session_ttl_secs: u64,
    #[arg(
        long,
        env = "DOCKYARD_UPLOAD_SWEEP_INTERVAL_SECS",
        default_value_t = DEFAULT_UPLOAD_SWEEP_INTERVAL_SECS,
        help = "Interval between expired session sweeps"
    )]
    pub upload_sweep_interval_secs: u64,
    #[arg(
        long,
        env = "DOCKYARD_ALLOWED_EXTENSIONS",
        value_delimiter = ',',
        help = "Comma separated file extensions accepted for upload"
    )]
    pub allowed_extensions: Vec<String>,
    #[arg(
        long,
        env = "DOCKYARD_DENIED_EXTENSIONS",
        value_delimiter = ',',
        help = "Comma separated file extensions refused for upload"
    )]
    pub denied_extensions: Vec<String>,
    #[arg(
        long,
        env = "DOCKYARD_ALLOWED_MIME_TYPES",
        value_delimiter = ',',
        help = "Comma separated MIME types accepted for upload (type/* allowed)"
    )]
    pub allowed_mime_types: Vec<String>,
    #[arg(
        long,
        env = "DOCKYARD_DENIED_MIME_TYPES",
        value_delimiter = ',',
        help = "Comma separated MIME types refused for upload (type/* allowed)"
    )]
    pub denied_mime_types: Vec<String>,
    #[arg(
        long,
        env = "DOCKYARD_OWNER_REFRESH_INTERVAL_SECS",
        default_value_t = DEFAULT_OWNER_REFRESH_INTERVAL_SECS,
        help = "Interval between user/group table refreshes"
    )]
    pub owner_refresh_interval_secs: u64,
    #[arg(
        long,
        env = "DOCKYARD_PASSWD_FILE",
        default_value = DEFAULT_PASSWD_FILE,
        help = "User table used for bulk owner name refresh"
    )]
    pub passwd_file: String,
    #[arg(
        long,
        env = "DOCKYARD_GROUP_FILE",
        default_value = DEFAULT_GROUP_FILE,
        help = "Group table used for bulk owner name refresh"
    )]
    pub group_file: String,
}
