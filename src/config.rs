//! CLI arguments and server configuration defaults.

use clap::Parser;

pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const UPLOAD_TEMP_DIR: &str = ".uploads";
pub const FILES_DIR: &str = "files";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const DEFAULT_DATABASE_URL: &str = "sqlite:.drive/metadata.db";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_UPLOAD_MAX_CHUNKS: u64 = 8192;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_DIRECT_MAX_FILE_SIZE: u64 = 64 * 1024 * 1024;
pub const DIRECT_MAX_FILES: usize = 100;
pub const DEFAULT_USER_QUOTA: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_USER_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const UPLOAD_SWEEP_INTERVAL_SECS: u64 = 900;
pub const UPLOAD_SWEEP_BATCH: u32 = 100;
pub const MAX_FOLDER_CREATE_ATTEMPTS: u32 = 3;
pub const MAX_FILENAME_BYTES: usize = 255;
pub const THUMBNAIL_QUEUE_CAPACITY: usize = 1024;

/// Extensions that are never accepted, regardless of the declared MIME type.
pub const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "com", "scr", "pif", "msi", "msp", "vbs", "vbe", "jse", "wsf", "wsh",
    "ps1", "psm1", "cpl", "hta", "jar", "dll", "reg", "lnk", "php", "phtml", "asp", "aspx", "jsp",
];

pub const BLOCKED_MIME_TYPES: &[&str] = &[
    "application/x-msdownload",
    "application/x-msdos-program",
    "application/x-executable",
    "application/x-sh",
    "application/x-bat",
    "application/vnd.microsoft.portable-executable",
];

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "drive-upload", version, about = "Drive upload and quota service")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "DRIVE_STORAGE_DIR",
        default_value = ".drive/storage",
        help = "Storage directory for files and upload chunks"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'd',
        long,
        env = "DRIVE_DATABASE_URL",
        default_value = DEFAULT_DATABASE_URL,
        help = "Metadata database URL (sqlite:<path> or postgres://...)"
    )]
    pub database_url: String,
    #[arg(
        long,
        env = "DRIVE_DATABASE_MAX_CONNECTIONS",
        default_value_t = DEFAULT_DATABASE_MAX_CONNECTIONS,
        help = "Max PostgreSQL pool connections (SQLite always uses one)"
    )]
    pub database_max_connections: u32,
    #[arg(
        short = 'b',
        long,
        env = "DRIVE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "DRIVE_HTTP_PORT",
        default_value_t = 5005,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(long, env = "DRIVE_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "DRIVE_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max bytes accepted per chunk"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "DRIVE_UPLOAD_MAX_CHUNKS",
        default_value_t = DEFAULT_UPLOAD_MAX_CHUNKS,
        help = "Max chunks per upload"
    )]
    pub upload_max_chunks: u64,
    #[arg(
        long,
        env = "DRIVE_MAX_FILE_SIZE",
        default_value_t = DEFAULT_MAX_FILE_SIZE,
        help = "Global max file size in bytes"
    )]
    pub max_file_size: u64,
    #[arg(
        long,
        env = "DRIVE_DIRECT_MAX_FILE_SIZE",
        default_value_t = DEFAULT_DIRECT_MAX_FILE_SIZE,
        help = "Max bytes per file on the direct (single request) upload path"
    )]
    pub direct_max_file_size: u64,
    #[arg(
        long,
        env = "DRIVE_DEFAULT_USER_QUOTA",
        default_value_t = DEFAULT_USER_QUOTA,
        help = "Storage quota given to newly provisioned users"
    )]
    pub default_user_quota: u64,
    #[arg(
        long,
        env = "DRIVE_DEFAULT_USER_MAX_FILE_SIZE",
        default_value_t = DEFAULT_USER_MAX_FILE_SIZE,
        help = "Per-user max file size given to newly provisioned users"
    )]
    pub default_user_max_file_size: u64,
    #[arg(
        long,
        env = "DRIVE_UPLOAD_SESSION_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_SESSION_TTL_SECS,
        help = "Idle time after which an unfinished upload releases its reservation (0 to disable)"
    )]
    pub upload_session_ttl_secs: u64,
}

/// Clamps a configured byte count into the signed range the database stores.
pub fn bytes_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
