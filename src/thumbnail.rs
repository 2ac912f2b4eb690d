//! 缩略图派生：图片直接拷贝，视频调用外部程序抽帧，目录结构镜像到 `thumbnail/`。

use futures_util::future::BoxFuture;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::process::Command;
use tokio::time;
use tracing::{debug, info};

use crate::atomic::AtomicFile;
use crate::storage::{ResolvedPath, Storage, StorageError};

pub const SOURCE_SEGMENT: &str = "photos";
pub const THUMBNAIL_SEGMENT: &str = "thumbnail";

const VIDEO_EXTENSIONS: [&str; 4] = [".mp4", ".avi", ".mov", ".wmv"];
const IMAGE_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".gif", ".bmp"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// 按后缀（不区分大小写）识别媒体类型。
    pub fn classify(name: &str) -> Option<Self> {
        if is_video(name) {
            Some(MediaKind::Video)
        } else if is_image(name) {
            Some(MediaKind::Image)
        } else {
            None
        }
    }
}

pub fn is_video(name: &str) -> bool {
    has_extension(name, &VIDEO_EXTENSIONS)
}

pub fn is_image(name: &str) -> bool {
    has_extension(name, &IMAGE_EXTENSIONS)
}

fn has_extension(name: &str, extensions: &[&str]) -> bool {
    let lower = name.to_lowercase();
    extensions.iter().any(|ext| lower.ends_with(ext))
}

/// 将根相对路径中最上层的 `photos` 段替换为 `thumbnail`；没有该段时返回 None。
pub fn thumbnail_relative(relative: &str) -> Option<String> {
    let mut segments: Vec<&str> = relative.split('/').collect();
    let position = segments.iter().position(|seg| *seg == SOURCE_SEGMENT)?;
    segments[position] = THUMBNAIL_SEGMENT;
    Some(segments.join("/"))
}

/// 抽取单帧的外部能力。
pub trait FrameExtractor: Send + Sync {
    /// 从 `input` 第 1 秒处抽取一帧，写成 JPEG 到 `output`。
    fn extract_frame<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), DeriveError>>;
}

/// 调用 ffmpeg 子进程抽帧。
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    binary: String,
    timeout: Duration,
}

impl FfmpegExtractor {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

impl FrameExtractor for FfmpegExtractor {
    fn extract_frame<'a>(
        &'a self,
        input: &'a Path,
        output: &'a Path,
    ) -> BoxFuture<'a, Result<(), DeriveError>> {
        Box::pin(async move {
            let mut child = Command::new(&self.binary)
                .arg("-y")
                .arg("-i")
                .arg(input)
                .args(["-ss", "00:00:01", "-frames:v", "1"])
                .arg(output)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()?;

            let waited = time::timeout(self.timeout, child.wait()).await;
            let status = match waited {
                Ok(status) => status?,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(DeriveError::Timeout(self.timeout));
                }
            };
            if !status.success() {
                return Err(DeriveError::ExtractorFailed(status.to_string()));
            }
            Ok(())
        })
    }
}

/// 单次上传批次内的派生状态：只有第一个媒体文件会触发派生。
#[derive(Debug, Default)]
pub struct BatchState {
    consumed: bool,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed
    }
}

pub struct ThumbnailDeriver {
    storage: Arc<Storage>,
    extractor: Arc<dyn FrameExtractor>,
}

impl ThumbnailDeriver {
    pub fn new(storage: Arc<Storage>, extractor: Arc<dyn FrameExtractor>) -> Self {
        Self { storage, extractor }
    }

    /// 对批次中第一个媒体文件尝试派生缩略图，返回生成的缩略图路径。
    ///
    /// 媒体文件不在 `photos` 命名空间下时同样占用批次名额，但不产生缩略图。
    pub async fn maybe_derive(
        &self,
        stored: &ResolvedPath,
        batch: &mut BatchState,
    ) -> Result<Option<ResolvedPath>, DeriveError> {
        if batch.is_consumed() {
            return Ok(None);
        }
        let Some(kind) = MediaKind::classify(stored.name()) else {
            return Ok(None);
        };
        batch.consumed = true;

        let Some(mut relative) = thumbnail_relative(&stored.relative) else {
            debug!(path = %stored.relative, "outside photos namespace, no thumbnail");
            return Ok(None);
        };
        if kind == MediaKind::Video {
            relative.push_str(".jpg");
        }
        let destination = self.storage.resolve(&[relative.as_str()])?;
        if let Some(parent) = destination.absolute.parent() {
            fs::create_dir_all(parent).await?;
        }

        match kind {
            MediaKind::Image => {
                let mut source = File::open(&stored.absolute).await?;
                AtomicFile::new(&destination.absolute)
                    .await?
                    .write_from(&mut source)
                    .await?;
            }
            MediaKind::Video => {
                self.extractor
                    .extract_frame(&stored.absolute, &destination.absolute)
                    .await?;
            }
        }

        info!(
            source = %stored.relative,
            thumbnail = %destination.relative,
            kind = ?kind,
            "thumbnail derived"
        );
        Ok(Some(destination))
    }
}

#[derive(Debug)]
pub enum DeriveError {
    Io(io::Error),
    InvalidPath,
    ExtractorFailed(String),
    Timeout(Duration),
}

impl fmt::Display for DeriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeriveError::Io(err) => write!(f, "error generating thumbnail: {err}"),
            DeriveError::InvalidPath => write!(f, "error generating thumbnail: invalid path"),
            DeriveError::ExtractorFailed(status) => {
                write!(f, "frame extraction failed: {status}")
            }
            DeriveError::Timeout(limit) => {
                write!(f, "frame extraction timed out after {}s", limit.as_secs())
            }
        }
    }
}

impl From<io::Error> for DeriveError {
    fn from(err: io::Error) -> Self {
        DeriveError::Io(err)
    }
}

impl From<StorageError> for DeriveError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidPath => DeriveError::InvalidPath,
            StorageError::DirCreate(err) | StorageError::Write(err) | StorageError::Io(err) => {
                DeriveError::Io(err)
            }
            other => DeriveError::Io(io::Error::other(other.to_string())),
        }
    }
}
