//! MediaDepot server binary.
//!
//! Accepts multipart uploads into a local storage tree, serves files and
//! directories back (listing or zip), and derives thumbnails for media stored
//! under `photos/` into a mirrored `thumbnail/` tree.

mod archive;
mod atomic;
mod background;
mod config;
mod error;
mod files;
mod http;
mod locator;
mod locking;
mod logging;
mod storage;
mod thumbnail;
mod upload;
mod version;

use axum::extract::{DefaultBodyLimit, Extension};
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info};

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::files::RetrievalConfig;
use crate::http::{build_cors_layer, request_span};
use crate::locator::Locator;
use crate::locking::LockManager;
use crate::storage::Storage;
use crate::thumbnail::{FfmpegExtractor, ThumbnailDeriver};
use crate::upload::{UploadConfig, UploadPipeline};

shadow!(build);

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;

    let locator = Arc::new(Locator::new(
        &args.public_protocol,
        &args.public_host,
        args.advertised_port(),
    ));
    let locks = Arc::new(LockManager::new());
    let extractor = Arc::new(FfmpegExtractor::new(
        args.ffmpeg_bin.clone(),
        Duration::from_secs(args.ffmpeg_timeout_secs),
    ));
    let pipeline = Arc::new(UploadPipeline::new(
        storage.clone(),
        ThumbnailDeriver::new(storage.clone(), extractor),
        locks.clone(),
        locator.as_ref().clone(),
        Duration::from_secs(args.lock_wait_secs),
    ));
    let upload_config = Arc::new(UploadConfig {
        max_total_size: args.upload_max_size,
        temp_dir: PathBuf::from(&args.temp_dir),
        temp_ttl: Duration::from_secs(args.upload_temp_ttl_secs),
    });
    let retrieval_config = Arc::new(RetrievalConfig {
        zip_max_size: args.zip_max_size,
    });

    let body_limit = match usize::try_from(upload_config.max_total_size) {
        Ok(0) => DefaultBodyLimit::disable(),
        Ok(limit) => DefaultBodyLimit::max(limit),
        Err(_) => DefaultBodyLimit::disable(),
    };

    info!(
        storage = %storage.root_path().display(),
        upload_max_size = args.upload_max_size,
        "storage ready"
    );

    let mut app = Router::new()
        .route("/upload", post(upload::upload_files).layer(body_limit))
        .route("/files/{*path}", get(files::get_file))
        .route("/thumbnail/{*path}", get(files::get_thumbnail))
        .route("/api/health", get(version::health))
        .route("/api/version", get(version::get_version_info))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(storage))
        .layer(Extension(pipeline))
        .layer(Extension(upload_config.clone()))
        .layer(Extension(retrieval_config))
        .layer(Extension(locator));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(upload_config, locks);
    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
