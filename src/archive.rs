//! 目录物化：列出当前层文件，或将整棵子树打包为内存中的 zip。

use std::ffi::OsString;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::storage::{ResolvedPath, StorageError};

/// 列出目录下一层的文件（跳过子目录），返回按名称排序的根相对路径。
pub async fn list_files(dir: &ResolvedPath) -> Result<Vec<String>, StorageError> {
    let mut reader = fs::read_dir(&dir.absolute).await?;
    let mut names = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            continue;
        }
        let Some(name) = utf8_name(entry.file_name()) else {
            continue;
        };
        names.push(name);
    }
    names.sort();

    Ok(names
        .into_iter()
        .map(|name| join_relative(&dir.relative, &name))
        .collect())
}

/// 返回目录中按名称排序的第一个文件，跳过以 `.` 开头的临时文件。
pub async fn first_file(dir: &ResolvedPath) -> Result<Option<String>, StorageError> {
    Ok(list_files(dir)
        .await?
        .into_iter()
        .find(|relative| !is_hidden(relative)))
}

fn is_hidden(relative: &str) -> bool {
    relative
        .rsplit('/')
        .next()
        .is_some_and(|name| name.starts_with('.'))
}

/// 非 UTF-8 文件名无法映射为 URL 或 zip 条目名，直接跳过。
fn utf8_name(raw: OsString) -> Option<String> {
    match raw.into_string() {
        Ok(name) => Some(name),
        Err(raw) => {
            warn!(name = ?raw, "skipping non-UTF-8 entry");
            None
        }
    }
}

/// 递归打包目录。整个归档缓存在内存中，`max_bytes` 限制文件内容总量（0 表示不限制）。
pub async fn zip_directory(dir: PathBuf, max_bytes: u64) -> Result<Vec<u8>, StorageError> {
    tokio::task::spawn_blocking(move || build_zip(&dir, max_bytes))
        .await
        .map_err(|err| StorageError::Archive(err.to_string()))?
}

fn build_zip(src: &Path, max_bytes: u64) -> Result<Vec<u8>, StorageError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut total = 0u64;
    append_dir(&mut writer, src, "", max_bytes, &mut total)?;
    let cursor = writer.finish().map_err(archive_error)?;
    Ok(cursor.into_inner())
}

fn append_dir(
    writer: &mut ZipWriter<Cursor<Vec<u8>>>,
    dir: &Path,
    prefix: &str,
    max_bytes: u64,
    total: &mut u64,
) -> Result<(), StorageError> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let Some(name) = utf8_name(entry.file_name()) else {
            continue;
        };
        let entry_name = join_relative(prefix, &name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            writer
                .add_directory(format!("{entry_name}/"), entry_options())
                .map_err(archive_error)?;
            append_dir(writer, &entry.path(), &entry_name, max_bytes, total)?;
        } else if file_type.is_file() {
            let mut file = std::fs::File::open(entry.path())?;
            *total = total.saturating_add(file.metadata()?.len());
            if max_bytes > 0 && *total > max_bytes {
                return Err(StorageError::ArchiveTooLarge(max_bytes));
            }
            writer
                .start_file(entry_name, entry_options())
                .map_err(archive_error)?;
            std::io::copy(&mut file, writer)?;
        }
        // 符号链接不跟随
    }

    Ok(())
}

fn entry_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn archive_error(err: zip::result::ZipError) -> StorageError {
    StorageError::Archive(err.to_string())
}

fn join_relative(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}
