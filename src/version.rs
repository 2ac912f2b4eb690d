//! 健康检查与版本信息处理器。

use axum::response::Json as JsonResponse;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthStatus {
    message: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    version: &'static str,
    build_time: &'static str,
    build_env: String,
}

pub async fn health() -> JsonResponse<HealthStatus> {
    JsonResponse(HealthStatus {
        message: "server is running",
    })
}

/// 返回当前版本信息。
pub async fn get_version_info() -> JsonResponse<VersionInfo> {
    JsonResponse(VersionInfo {
        version: crate::build::PKG_VERSION,
        build_time: crate::build::BUILD_TIME,
        build_env: format!(
            "{},{}",
            crate::build::RUST_VERSION,
            crate::build::RUST_CHANNEL
        ),
    })
}
