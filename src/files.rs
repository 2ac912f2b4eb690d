//! 文件读取：单文件流式返回，目录返回列表或 zip，缩略图定位。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use percent_encoding::utf8_percent_encode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::archive::{first_file, list_files, zip_directory};
use crate::error::ApiError;
use crate::locator::{Locator, SEGMENT_ENCODE_SET, files_path};
use crate::storage::{ArtifactInfo, ResolvedPath, Storage};
use crate::thumbnail::thumbnail_relative;

#[derive(Debug)]
pub struct RetrievalConfig {
    pub zip_max_size: u64,
}

#[derive(Deserialize, Default)]
pub struct FileQuery {
    #[serde(rename = "isDownload")]
    is_download: Option<String>,
}

impl FileQuery {
    fn download_requested(&self) -> bool {
        self.is_download.as_deref() == Some("true")
    }
}

#[derive(Debug, Serialize)]
pub struct FileListing {
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ThumbnailResponse {
    pub message: String,
    pub url: String,
}

/// 读取请求的分支结果。
#[derive(Debug)]
pub enum Retrieval {
    Archive { name: String, data: Vec<u8> },
    Listing(Vec<String>),
    File {
        target: ResolvedPath,
        info: ArtifactInfo,
        download: bool,
    },
}

/// 按目标类型与下载标记决定返回内容。
pub async fn retrieve(
    storage: &Storage,
    captured: &str,
    download: bool,
    zip_max_size: u64,
) -> Result<Retrieval, ApiError> {
    let target = storage.resolve_checked(&[captured], false).await?;
    let info = storage.stat(&target).await?;

    match (info.is_dir, download) {
        (true, true) => {
            let data = zip_directory(target.absolute.clone(), zip_max_size).await?;
            let name = if info.name.is_empty() {
                "files".to_string()
            } else {
                info.name
            };
            Ok(Retrieval::Archive { name, data })
        }
        (true, false) => {
            let files = list_files(&target)
                .await?
                .iter()
                .map(|relative| files_path(relative))
                .collect();
            Ok(Retrieval::Listing(files))
        }
        (false, download) => Ok(Retrieval::File {
            target,
            info,
            download,
        }),
    }
}

/// 获取文件或目录；`isDownload=true` 时以附件形式返回（目录打包为 zip）。
pub async fn get_file(
    Path(path): Path<String>,
    Query(query): Query<FileQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(retrieval): Extension<Arc<RetrievalConfig>>,
) -> Result<Response, ApiError> {
    let download = query.download_requested();
    match retrieve(&storage, &path, download, retrieval.zip_max_size).await? {
        Retrieval::Archive { name, data } => {
            info!(path = %path, size = data.len(), "download directory archive");
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/zip"),
            );
            headers.insert(
                header::CONTENT_DISPOSITION,
                attachment_header(&format!("{name}.zip"))?,
            );
            Ok((StatusCode::OK, headers, data).into_response())
        }
        Retrieval::Listing(files) => {
            debug!(path = %path, count = files.len(), "list directory");
            Ok(JsonResponse(FileListing { files }).into_response())
        }
        Retrieval::File {
            target,
            info,
            download,
        } => file_response(&storage, &target, &info, download).await,
    }
}

async fn file_response(
    storage: &Storage,
    target: &ResolvedPath,
    info: &ArtifactInfo,
    download: bool,
) -> Result<Response, ApiError> {
    let file = storage.open(target).await?;

    let mut headers = HeaderMap::new();
    if download {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(header::CONTENT_DISPOSITION, attachment_header(&info.name)?);
    } else {
        let mime = mime_guess::from_path(&info.name).first_or_octet_stream();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(mime.essence_str())
                .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
        );
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(info.size));
    if let Some(modified) = info.modified {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("failed to build response headers".into()))?,
        );
    }

    info!(path = %target.relative, size = info.size, download, "serve file");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 构造 `attachment` 头：ASCII 回退文件名加 RFC 5987 编码的原始文件名。
fn attachment_header(name: &str) -> Result<HeaderValue, ApiError> {
    let fallback: String = name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut value = format!("attachment; filename=\"{fallback}\"");
    if fallback != name {
        value.push_str("; filename*=UTF-8''");
        value.push_str(&utf8_percent_encode(name, SEGMENT_ENCODE_SET).to_string());
    }
    HeaderValue::from_str(&value)
        .map_err(|_| ApiError::Internal("failed to build response headers".into()))
}

/// 定位路径对应的第一个缩略图；目录取自身，文件取其父目录。
pub async fn locate_thumbnail(storage: &Storage, captured: &str) -> Result<String, ApiError> {
    let target = storage.resolve_checked(&[captured], false).await?;
    let info = storage.stat(&target).await?;
    let dir_relative = if info.is_dir {
        target.relative.as_str()
    } else {
        target.parent_relative()
    };

    let not_found = || ApiError::NotFound("no thumbnail found".into());
    let thumb_relative = thumbnail_relative(dir_relative).ok_or_else(not_found)?;
    let thumb_dir = match storage.resolve_checked(&[thumb_relative.as_str()], false).await {
        Ok(dir) => dir,
        Err(err) => match ApiError::from(err) {
            ApiError::NotFound(_) => return Err(not_found()),
            other => return Err(other),
        },
    };
    if !storage.stat(&thumb_dir).await?.is_dir {
        return Err(not_found());
    }
    first_file(&thumb_dir).await?.ok_or_else(not_found)
}

/// 返回缩略图地址。
pub async fn get_thumbnail(
    Path(path): Path<String>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locator): Extension<Arc<Locator>>,
) -> Result<(StatusCode, JsonResponse<ThumbnailResponse>), ApiError> {
    let relative = locate_thumbnail(&storage, &path).await?;
    debug!(path = %path, thumbnail = %relative, "thumbnail located");
    Ok((
        StatusCode::ACCEPTED,
        JsonResponse(ThumbnailResponse {
            message: "thumbnail image is successfully retrieved".into(),
            url: locator.file_url(&relative),
        }),
    ))
}
