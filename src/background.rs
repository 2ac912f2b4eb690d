//! 后台任务：清理上传暂存目录与空闲路径锁。

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{LOCK_PRUNE_INTERVAL_SECS, UPLOAD_CLEAN_INTERVAL_SECS};
use crate::locking::LockManager;
use crate::upload::{UploadConfig, cleanup_upload_temp};

pub fn spawn_background_tasks(upload: Arc<UploadConfig>, locks: Arc<LockManager>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(UPLOAD_CLEAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = cleanup_upload_temp(&upload).await {
                warn!(error = %err, "upload spool cleanup failed");
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(LOCK_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            let pruned = locks.prune_idle().await;
            if pruned > 0 {
                debug!(pruned, "pruned idle path locks");
            }
        }
    });
}
