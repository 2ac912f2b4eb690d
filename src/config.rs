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

pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_UPLOAD_TEMP_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_ZIP_MAX_SIZE: u64 = 512 * 1024 * 1024;
pub const DEFAULT_FFMPEG_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const UPLOAD_CLEAN_INTERVAL_SECS: u64 = 900;
pub const LOCK_PRUNE_INTERVAL_SECS: u64 = 300;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "media-depot", version = VERSION_INFO, about = "Media storage server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "DEPOT_STORAGE_DIR",
        default_value = "./files",
        help = "Storage root directory"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "DEPOT_TEMP_DIR",
        default_value = ".depot/temp",
        help = "Spool directory for multipart uploads"
    )]
    pub temp_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "DEPOT_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "DEPOT_PORT",
        default_value_t = 8081,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        long,
        env = "DEPOT_PUBLIC_PROTOCOL",
        default_value = "http",
        help = "Protocol used in returned file URLs"
    )]
    pub public_protocol: String,
    #[arg(
        long,
        env = "DEPOT_PUBLIC_HOST",
        default_value = "localhost",
        help = "Host used in returned file URLs"
    )]
    pub public_host: String,
    #[arg(
        long,
        env = "DEPOT_PUBLIC_PORT",
        help = "Port used in returned file URLs (defaults to the HTTP port)"
    )]
    pub public_port: Option<u16>,
    #[arg(long, env = "DEPOT_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "DEPOT_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload request size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "DEPOT_UPLOAD_TEMP_TTL_SECS",
        default_value_t = DEFAULT_UPLOAD_TEMP_TTL_SECS,
        help = "Spool cleanup threshold in seconds (0 to disable)"
    )]
    pub upload_temp_ttl_secs: u64,
    #[arg(
        long,
        env = "DEPOT_ZIP_MAX_SIZE",
        default_value_t = DEFAULT_ZIP_MAX_SIZE,
        help = "Max total file bytes packed into one zip download (0 to disable)"
    )]
    pub zip_max_size: u64,
    #[arg(
        long,
        env = "DEPOT_FFMPEG_BIN",
        default_value = "ffmpeg",
        help = "Frame extraction binary for video thumbnails"
    )]
    pub ffmpeg_bin: String,
    #[arg(
        long,
        env = "DEPOT_FFMPEG_TIMEOUT_SECS",
        default_value_t = DEFAULT_FFMPEG_TIMEOUT_SECS,
        help = "Frame extraction timeout in seconds"
    )]
    pub ffmpeg_timeout_secs: u64,
    #[arg(
        long,
        env = "DEPOT_LOCK_WAIT_SECS",
        default_value_t = DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        help = "Max wait for a per-path write lock in seconds"
    )]
    pub lock_wait_secs: u64,
}

impl Args {
    pub fn advertised_port(&self) -> u16 {
        self.public_port.unwrap_or(self.http_port)
    }
}
