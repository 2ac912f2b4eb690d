//! 存储根目录下的路径解析与文件提交/读取。

use chrono::{DateTime, Utc};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt, ErrorKind};

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

/// 已解析的存储路径：绝对路径与以 `/` 分隔的根相对路径。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    pub absolute: PathBuf,
    pub relative: String,
}

impl ResolvedPath {
    /// 最后一个路径段；根目录为空字符串。
    pub fn name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or_default()
    }

    /// 父目录的根相对路径。
    pub fn parent_relative(&self) -> &str {
        match self.relative.rfind('/') {
            Some(index) => &self.relative[..index],
            None => "",
        }
    }
}

/// 提交成功的文件。
#[derive(Debug)]
pub struct StoredArtifact {
    pub path: ResolvedPath,
    pub size: u64,
    pub modified: Option<String>,
}

#[derive(Debug)]
pub struct ArtifactInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<std::time::SystemTime>,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 将不可信的路径片段规整后拼接到根目录下。
    ///
    /// `.` 与空段被丢弃，`..` 回退一级；回退越过根目录即视为 `InvalidPath`。
    /// 结果不以根目录为前缀时同样拒绝。
    pub fn resolve(&self, segments: &[&str]) -> Result<ResolvedPath, StorageError> {
        let mut parts: Vec<&str> = Vec::new();
        for segment in segments {
            for piece in segment.split(['/', '\\']) {
                match piece {
                    "" | "." => continue,
                    ".." => {
                        if parts.pop().is_none() {
                            return Err(StorageError::InvalidPath);
                        }
                    }
                    name if name.contains('\0') => return Err(StorageError::InvalidPath),
                    name => parts.push(name),
                }
            }
        }

        let relative = parts.join("/");
        let absolute = if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&relative)
        };
        if !absolute.starts_with(&self.root) {
            return Err(StorageError::InvalidPath);
        }
        Ok(ResolvedPath { absolute, relative })
    }

    /// 上传目标：目录取调用方的 folder，文件名只保留 base name。
    pub fn resolve_upload_target(
        &self,
        folder: &str,
        file_name: &str,
    ) -> Result<ResolvedPath, StorageError> {
        let base = base_name(file_name).ok_or(StorageError::InvalidPath)?;
        self.resolve(&[folder, base])
    }

    /// 解析并校验路径上不存在符号链接或非目录的中间段。
    pub async fn resolve_checked(
        &self,
        segments: &[&str],
        allow_missing_leaf: bool,
    ) -> Result<ResolvedPath, StorageError> {
        let target = self.resolve(segments)?;
        self.ensure_no_symlink_components(&target.absolute, allow_missing_leaf)
            .await?;
        Ok(target)
    }

    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing_leaf: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = PathBuf::from(&self.root);
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing_leaf => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 流式写入目标文件并校验非空。
    ///
    /// 校验失败时文件保留在原处，不做回滚。
    pub async fn commit<R>(
        &self,
        target: &ResolvedPath,
        source: &mut R,
    ) -> Result<StoredArtifact, StorageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if let Some(parent) = target.absolute.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(StorageError::DirCreate)?;
        }

        match fs::metadata(&target.absolute).await {
            Ok(metadata) if metadata.is_dir() => {
                return Err(StorageError::IsDirectory(target.relative.clone()));
            }
            _ => {}
        }

        let mut file = File::create(&target.absolute)
            .await
            .map_err(StorageError::Write)?;
        tokio::io::copy(source, &mut file)
            .await
            .map_err(StorageError::Write)?;
        file.flush().await.map_err(StorageError::Write)?;
        file.sync_all().await.map_err(StorageError::Write)?;
        drop(file);

        let metadata = fs::metadata(&target.absolute).await?;
        if metadata.len() == 0 {
            return Err(StorageError::Verify(format!(
                "{} is zero bytes after saving",
                target.relative
            )));
        }

        Ok(StoredArtifact {
            path: target.clone(),
            size: metadata.len(),
            modified: metadata
                .modified()
                .ok()
                .and_then(|ts| ts.duration_since(UNIX_EPOCH).ok())
                .map(format_timestamp),
        })
    }

    pub async fn stat(&self, target: &ResolvedPath) -> Result<ArtifactInfo, StorageError> {
        let metadata = fs::metadata(&target.absolute).await?;
        Ok(ArtifactInfo {
            name: target.name().to_string(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }

    pub async fn open(&self, target: &ResolvedPath) -> Result<File, StorageError> {
        Ok(File::open(&target.absolute).await?)
    }
}

/// 取上传文件名的最后一段，忽略客户端附带的目录部分。
pub fn base_name(file_name: &str) -> Option<&str> {
    file_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

fn format_timestamp(duration: Duration) -> String {
    let timestamp = UNIX_EPOCH + duration;
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    IsDirectory(String),
    DirCreate(io::Error),
    Write(io::Error),
    Verify(String),
    ArchiveTooLarge(u64),
    Archive(String),
    Io(io::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::InvalidPath => write!(f, "invalid path"),
            StorageError::IsDirectory(path) => write!(f, "{path} is a directory"),
            StorageError::DirCreate(err) => write!(f, "error creating directory: {err}"),
            StorageError::Write(err) => write!(f, "error saving file: {err}"),
            StorageError::Verify(msg) => write!(f, "{msg}"),
            StorageError::ArchiveTooLarge(limit) => {
                write!(f, "directory exceeds archive limit of {limit} bytes")
            }
            StorageError::Archive(msg) => write!(f, "error building archive: {msg}"),
            StorageError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{Storage, StorageError, base_name};
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");
        (temp, Storage::new(root))
    }

    #[test]
    fn resolve_collapses_dot_segments_inside_root() {
        let (_temp, storage) = make_storage();
        let resolved = storage
            .resolve(&["/photos/./x/../y//", "a.png"])
            .expect("resolve");
        assert_eq!(resolved.relative, "photos/y/a.png");
        assert_eq!(resolved.absolute, storage.root_path().join("photos/y/a.png"));
        assert_eq!(resolved.name(), "a.png");
        assert_eq!(resolved.parent_relative(), "photos/y");
    }

    #[test]
    fn resolve_rejects_escape_above_root() {
        let (_temp, storage) = make_storage();
        for input in ["..", "../secret", "a/../../b", "/../etc/passwd", "..\\x"] {
            let result = storage.resolve(&[input]);
            assert!(
                matches!(result, Err(StorageError::InvalidPath)),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn resolve_anchors_absolute_input_under_root() {
        let (_temp, storage) = make_storage();
        let resolved = storage.resolve(&["/etc/passwd"]).expect("resolve");
        assert!(resolved.absolute.starts_with(storage.root_path()));
        assert_eq!(resolved.relative, "etc/passwd");
    }

    #[test]
    fn upload_target_strips_directories_from_file_name() {
        let (_temp, storage) = make_storage();
        let resolved = storage
            .resolve_upload_target("photos/x", "../../etc/passwd")
            .expect("resolve");
        assert_eq!(resolved.relative, "photos/x/passwd");

        assert!(matches!(
            storage.resolve_upload_target("photos/x", ".."),
            Err(StorageError::InvalidPath)
        ));
        assert_eq!(base_name("C:\\Users\\me\\pic.jpg"), Some("pic.jpg"));
        assert_eq!(base_name("dir/"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_checked_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");

        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        let link_path = root.join("link");
        symlink(&outside, &link_path).expect("symlink");

        let storage = Storage::new(root);
        let result = storage.resolve_checked(&["link"], false).await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[tokio::test]
    async fn commit_creates_parents_and_reports_size() {
        let (_temp, storage) = make_storage();
        let target = storage
            .resolve_upload_target("photos/deep/nested", "a.bin")
            .expect("resolve");
        let mut source: &[u8] = b"payload";
        let stored = storage.commit(&target, &mut source).await.expect("commit");

        assert_eq!(stored.size, 7);
        assert!(stored.modified.is_some());
        let contents = std::fs::read(&target.absolute).expect("read back");
        assert_eq!(contents, b"payload");

        let info = storage.stat(&target).await.expect("stat");
        assert!(!info.is_dir);
        assert_eq!(info.name, "a.bin");
    }

    #[tokio::test]
    async fn commit_of_empty_source_fails_verification_and_keeps_file() {
        let (_temp, storage) = make_storage();
        let target = storage.resolve_upload_target("docs", "empty.txt").expect("resolve");
        let mut source: &[u8] = b"";
        let result = storage.commit(&target, &mut source).await;

        assert!(matches!(result, Err(StorageError::Verify(_))));
        assert!(target.absolute.exists(), "zero-byte file is left in place");
    }

    #[tokio::test]
    async fn commit_onto_existing_directory_is_rejected() {
        let (_temp, storage) = make_storage();
        std::fs::create_dir_all(storage.root_path().join("docs/sub")).expect("mkdir sub");
        let target = storage.resolve_upload_target("docs", "sub").expect("resolve");
        let mut source: &[u8] = b"payload";

        match storage.commit(&target, &mut source).await {
            Err(StorageError::IsDirectory(path)) => assert_eq!(path, "docs/sub"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(target.absolute.is_dir());
    }

    #[tokio::test]
    async fn stat_missing_path_is_not_found() {
        let (_temp, storage) = make_storage();
        let target = storage.resolve(&["nope"]).expect("resolve");
        match storage.stat(&target).await {
            Err(StorageError::Io(err)) => assert_eq!(err.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
