//! 多文件上传：multipart 落盘暂存，按提交顺序逐个写入存储并派生缩略图。

use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::Json as JsonResponse;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::locator::Locator;
use crate::locking::LockManager;
use crate::storage::{Storage, StorageError, base_name};
use crate::thumbnail::{BatchState, ThumbnailDeriver};

#[derive(Debug)]
pub struct UploadConfig {
    pub max_total_size: u64,
    pub temp_dir: PathBuf,
    pub temp_ttl: Duration,
}

/// 已暂存到临时目录、等待提交的上传文件。
#[derive(Debug)]
pub struct SpooledFile {
    pub index: usize,
    pub file_name: String,
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct SpooledForm {
    pub folder: String,
    pub files: Vec<SpooledFile>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub url: Vec<String>,
}

/// 串联路径解析、写入校验与缩略图派生。
///
/// 批次不具备原子性：第 K 个文件失败时立即返回，之前已提交的文件保留，之后的文件不再处理。
pub struct UploadPipeline {
    storage: Arc<Storage>,
    deriver: ThumbnailDeriver,
    locks: Arc<LockManager>,
    locator: Locator,
    lock_wait: Duration,
}

impl UploadPipeline {
    pub fn new(
        storage: Arc<Storage>,
        deriver: ThumbnailDeriver,
        locks: Arc<LockManager>,
        locator: Locator,
        lock_wait: Duration,
    ) -> Self {
        Self {
            storage,
            deriver,
            locks,
            locator,
            lock_wait,
        }
    }

    pub async fn handle(
        &self,
        folder: &str,
        files: &[SpooledFile],
    ) -> Result<UploadResponse, ApiError> {
        if files.is_empty() {
            return Err(ApiError::BadRequest("no file provided".into()));
        }

        let mut batch = BatchState::new();
        let mut urls = Vec::with_capacity(files.len());
        for file in files {
            debug!(index = file.index, name = %file.file_name, "processing file");
            let url = self
                .commit_one(folder, file, &mut batch)
                .await
                .map_err(|err| {
                    let context = format!("file {} ({})", file.index, file.file_name);
                    let err = err.with_context(&context);
                    warn!(folder, error = err.message(), "upload batch aborted");
                    err
                })?;
            urls.push(url);
        }

        info!(folder, count = files.len(), "upload batch committed");
        Ok(UploadResponse {
            message: format!("{} files uploaded successfully", files.len()),
            url: urls,
        })
    }

    async fn commit_one(
        &self,
        folder: &str,
        file: &SpooledFile,
        batch: &mut BatchState,
    ) -> Result<String, ApiError> {
        let name = base_name(&file.file_name).ok_or(StorageError::InvalidPath)?;
        let target = self.storage.resolve_checked(&[folder, name], true).await?;

        let _guard = self
            .locks
            .lock_path_with_timeout(&target.relative, self.lock_wait)
            .await
            .map_err(|_| ApiError::Conflict("path locked".into()))?;

        let mut source = File::open(&file.path)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let stored = self.storage.commit(&target, &mut source).await?;
        debug!(
            path = %stored.path.relative,
            size = stored.size,
            modified = ?stored.modified,
            "file committed"
        );

        self.deriver.maybe_derive(&target, batch).await?;
        Ok(self.locator.file_url(&target.relative))
    }
}

/// 接收 multipart 上传（`folder` 文本字段与一个或多个 `file` 字段）。
pub async fn upload_files(
    Extension(pipeline): Extension<Arc<UploadPipeline>>,
    Extension(upload): Extension<Arc<UploadConfig>>,
    multipart: Multipart,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let spool_dir = upload.temp_dir.join(Uuid::new_v4().to_string());
    fs::create_dir_all(&spool_dir)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;

    let result: Result<UploadResponse, ApiError> = async {
        let form = spool_multipart(multipart, &spool_dir).await?;
        info!(folder = %form.folder, files = form.files.len(), "upload received");
        pipeline.handle(&form.folder, &form.files).await
    }
    .await;

    if let Err(err) = fs::remove_dir_all(&spool_dir).await {
        warn!(path = ?spool_dir, error = %err, "failed to remove upload spool dir");
    }
    result.map(JsonResponse)
}

/// 按流顺序读取字段，文件内容逐块写入暂存目录。
async fn spool_multipart(
    mut multipart: Multipart,
    spool_dir: &Path,
) -> Result<SpooledForm, ApiError> {
    let mut form = SpooledForm::default();

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "folder" => {
                form.folder = field.text().await.map_err(multipart_error)?;
            }
            "file" => {
                let index = form.files.len();
                let file_name = field.file_name().unwrap_or_default().to_string();
                let path = spool_dir.join(format!("{index}.part"));
                let mut out = File::create(&path)
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                let mut written: u64 = 0;
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    written += chunk.len() as u64;
                    out.write_all(&chunk)
                        .await
                        .map_err(|err| ApiError::Internal(err.to_string()))?;
                }
                out.flush()
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                debug!(index, name = %file_name, bytes = written, "file part spooled");
                form.files.push(SpooledFile {
                    index,
                    file_name,
                    path,
                });
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }

    Ok(form)
}

fn multipart_error(err: MultipartError) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(err.body_text())
    } else {
        ApiError::BadRequest(format!("error parsing form data: {}", err.body_text()))
    }
}

/// 清理过期的上传暂存目录。
pub async fn cleanup_upload_temp(upload: &UploadConfig) -> Result<(), std::io::Error> {
    if upload.temp_ttl.is_zero() {
        return Ok(());
    }
    if fs::metadata(&upload.temp_dir).await.is_err() {
        return Ok(());
    }

    let now = SystemTime::now();
    let mut dir = fs::read_dir(&upload.temp_dir).await?;
    while let Some(entry) = dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_dir() {
            continue;
        }
        let modified = match metadata.modified() {
            Ok(value) => value,
            Err(_) => continue,
        };
        let age = match now.duration_since(modified) {
            Ok(value) => value,
            Err(_) => continue,
        };
        if age >= upload.temp_ttl {
            let path = entry.path();
            if let Err(err) = fs::remove_dir_all(&path).await {
                warn!(path = ?path, error = %err, "failed to remove stale upload spool dir");
            } else {
                info!(path = ?path, "removed stale upload spool dir");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body as AxumBody;
    use axum::extract::{DefaultBodyLimit, FromRequest};
    use axum::http::{Request, header};
    use axum::routing::post;
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::thumbnail::tests::RecordingExtractor;

    struct Harness {
        temp: tempfile::TempDir,
        storage: Arc<Storage>,
        extractor: Arc<RecordingExtractor>,
        locks: Arc<LockManager>,
        pipeline: Arc<UploadPipeline>,
    }

    fn make_harness(extractor: RecordingExtractor) -> Harness {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        let storage = Arc::new(Storage::new(root));
        let extractor = Arc::new(extractor);
        let deriver = ThumbnailDeriver::new(storage.clone(), extractor.clone());
        let locks = Arc::new(LockManager::new());
        let pipeline = Arc::new(UploadPipeline::new(
            storage.clone(),
            deriver,
            locks.clone(),
            Locator::new("http", "localhost", 8081),
            Duration::from_millis(50),
        ));
        Harness {
            temp,
            storage,
            extractor,
            locks,
            pipeline,
        }
    }

    fn spool(harness: &Harness, files: &[(&str, &str)]) -> Vec<SpooledFile> {
        let spool_dir = harness.temp.path().join("spool");
        std::fs::create_dir_all(&spool_dir).expect("create spool dir");
        files
            .iter()
            .enumerate()
            .map(|(index, (name, bytes))| {
                let path = spool_dir.join(format!("{index}.part"));
                std::fs::write(&path, bytes.as_bytes()).expect("write spool file");
                SpooledFile {
                    index,
                    file_name: name.to_string(),
                    path,
                }
            })
            .collect()
    }

    fn multipart_request(parts: &[(&str, Option<&str>, &str)]) -> Request<AxumBody> {
        let boundary = "depot-test-boundary";
        let mut body = Vec::new();
        for (name, file_name, data) in parts {
            body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            let disposition = match file_name {
                Some(file_name) => format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                ),
                None => format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"),
            };
            body.extend_from_slice(disposition.as_bytes());
            body.extend_from_slice(data.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(AxumBody::from(body))
            .expect("build request")
    }

    fn upload_config(harness: &Harness) -> Arc<UploadConfig> {
        Arc::new(UploadConfig {
            max_total_size: 0,
            temp_dir: harness.temp.path().join("temp"),
            temp_ttl: Duration::from_secs(60),
        })
    }

    #[tokio::test]
    async fn batch_commits_in_order_and_derives_one_thumbnail() {
        let harness = make_harness(RecordingExtractor::default());
        let files = spool(
            &harness,
            &[("a.png", "first"), ("b.mp4", "video"), ("c.png", "third")],
        );

        let response = harness
            .pipeline
            .handle("photos/x", &files)
            .await
            .expect("upload");

        assert_eq!(response.message, "3 files uploaded successfully");
        assert_eq!(
            response.url,
            vec![
                "http://localhost:8081/files/photos/x/a.png",
                "http://localhost:8081/files/photos/x/b.mp4",
                "http://localhost:8081/files/photos/x/c.png",
            ]
        );
        let root = harness.storage.root_path();
        assert_eq!(
            std::fs::read(root.join("thumbnail/x/a.png")).expect("thumbnail"),
            b"first"
        );
        assert!(!root.join("thumbnail/x/c.png").exists());
        assert_eq!(harness.extractor.call_count(), 0);
    }

    #[tokio::test]
    async fn failing_file_stops_batch_without_rollback() {
        let harness = make_harness(RecordingExtractor::default());
        let files = spool(
            &harness,
            &[("a.txt", "aaa"), ("b.txt", ""), ("c.txt", "ccc")],
        );

        let err = harness
            .pipeline
            .handle("docs", &files)
            .await
            .expect_err("zero-byte file must fail");

        assert!(matches!(err, ApiError::Internal(_)));
        assert!(err.message().contains("file 1 (b.txt)"), "{}", err.message());
        let root = harness.storage.root_path();
        assert_eq!(std::fs::read(root.join("docs/a.txt")).expect("a kept"), b"aaa");
        assert!(!root.join("docs/c.txt").exists(), "c.txt must not be attempted");
    }

    #[tokio::test]
    async fn empty_batch_is_bad_request() {
        let harness = make_harness(RecordingExtractor::default());
        let result = harness.pipeline.handle("photos/x", &[]).await;
        assert!(matches!(result, Err(ApiError::BadRequest(msg)) if msg == "no file provided"));
    }

    #[tokio::test]
    async fn traversal_folder_is_rejected() {
        let harness = make_harness(RecordingExtractor::default());
        let files = spool(&harness, &[("a.txt", "data")]);

        let result = harness.pipeline.handle("../../outside", &files).await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(!harness.temp.path().join("outside").exists());
    }

    #[tokio::test]
    async fn traversal_file_name_stays_in_folder() {
        let harness = make_harness(RecordingExtractor::default());
        let files = spool(&harness, &[("../../escape.txt", "data")]);

        let response = harness.pipeline.handle("docs", &files).await.expect("upload");

        assert_eq!(
            response.url,
            vec!["http://localhost:8081/files/docs/escape.txt"]
        );
        assert!(harness.storage.root_path().join("docs/escape.txt").exists());
    }

    #[tokio::test]
    async fn file_onto_existing_directory_is_bad_request() {
        let harness = make_harness(RecordingExtractor::default());
        std::fs::create_dir_all(harness.storage.root_path().join("docs/sub"))
            .expect("mkdir sub");
        let files = spool(&harness, &[("sub", "data")]);

        let err = harness
            .pipeline
            .handle("docs", &files)
            .await
            .expect_err("directory target must fail");

        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.message().contains("file 0 (sub)"), "{}", err.message());
        assert!(harness.storage.root_path().join("docs/sub").is_dir());
    }

    #[tokio::test]
    async fn held_path_lock_returns_conflict() {
        let harness = make_harness(RecordingExtractor::default());
        let _held = harness
            .locks
            .lock_path_with_timeout("docs/a.txt", Duration::from_secs(1))
            .await
            .expect("hold lock");
        let files = spool(&harness, &[("a.txt", "data")]);

        let err = harness
            .pipeline
            .handle("docs", &files)
            .await
            .expect_err("locked path must fail");

        assert!(matches!(err, ApiError::Conflict(_)));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(!harness.storage.root_path().join("docs/a.txt").exists());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_before_any_commit() {
        let harness = make_harness(RecordingExtractor::default());
        let upload = upload_config(&harness);
        let app = Router::new()
            .route(
                "/upload",
                post(upload_files).layer(DefaultBodyLimit::max(64)),
            )
            .layer(Extension(harness.pipeline.clone()))
            .layer(Extension(upload.clone()));
        let payload = "x".repeat(500);
        let request = multipart_request(&[
            ("folder", None, "docs"),
            ("file", Some("small.txt"), "ok"),
            ("file", Some("big.bin"), payload.as_str()),
        ]);

        let response = app.oneshot(request).await.expect("router response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let stored = std::fs::read_dir(harness.storage.root_path())
            .expect("read root")
            .count();
        assert_eq!(stored, 0, "nothing may be committed");
        let leftovers = std::fs::read_dir(&upload.temp_dir).expect("temp dir").count();
        assert_eq!(leftovers, 0, "spool dir should be removed");
    }

    #[tokio::test]
    async fn derivation_failure_aborts_batch() {
        let harness = make_harness(RecordingExtractor {
            fail: true,
            ..Default::default()
        });
        let files = spool(&harness, &[("v.mp4", "video"), ("z.txt", "text")]);

        let err = harness
            .pipeline
            .handle("photos/x", &files)
            .await
            .expect_err("derivation failure must fail the batch");

        assert!(matches!(err, ApiError::Internal(_)));
        let root = harness.storage.root_path();
        assert!(root.join("photos/x/v.mp4").exists());
        assert!(!root.join("photos/x/z.txt").exists());
    }

    #[tokio::test]
    async fn handler_spools_multipart_and_cleans_up() {
        let harness = make_harness(RecordingExtractor::default());
        let upload = upload_config(&harness);
        let request = multipart_request(&[
            ("file", Some("one.txt"), "1"),
            ("file", Some("two.txt"), "22"),
            ("folder", None, "notes/2024"),
        ]);
        let multipart = Multipart::from_request(request, &())
            .await
            .expect("multipart extractor");

        let JsonResponse(response) = upload_files(
            Extension(harness.pipeline.clone()),
            Extension(upload.clone()),
            multipart,
        )
        .await
        .expect("upload");

        assert_eq!(response.url.len(), 2);
        let root = harness.storage.root_path();
        assert_eq!(std::fs::read(root.join("notes/2024/two.txt")).expect("two"), b"22");
        let leftovers = std::fs::read_dir(&upload.temp_dir).expect("temp dir").count();
        assert_eq!(leftovers, 0, "spool dir should be removed");
    }

    #[tokio::test]
    async fn handler_without_files_is_bad_request() {
        let harness = make_harness(RecordingExtractor::default());
        let upload = upload_config(&harness);
        let request = multipart_request(&[("folder", None, "photos/x")]);
        let multipart = Multipart::from_request(request, &())
            .await
            .expect("multipart extractor");

        let result = upload_files(
            Extension(harness.pipeline.clone()),
            Extension(upload),
            multipart,
        )
        .await;

        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_spool_dirs() {
        let temp = tempdir().expect("tempdir");
        let upload = UploadConfig {
            max_total_size: 0,
            temp_dir: temp.path().join("temp"),
            temp_ttl: Duration::from_secs(3600),
        };
        std::fs::create_dir_all(upload.temp_dir.join("fresh")).expect("mkdir fresh");

        cleanup_upload_temp(&upload).await.expect("cleanup");
        assert!(upload.temp_dir.join("fresh").exists());

        let expired = UploadConfig {
            temp_ttl: Duration::from_nanos(1),
            ..upload
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        cleanup_upload_temp(&expired).await.expect("cleanup");
        assert!(!expired.temp_dir.join("fresh").exists());
    }
}
