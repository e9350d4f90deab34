//! Drive upload server binary.
//!
//! This crate hosts the chunked-upload and quota-reservation engine of the
//! drive: upload sessions, chunk storage, merging, direct batch uploads and
//! the quota ledger. The main entry point opens the metadata store, builds the
//! Axum router and serves HTTP until a shutdown signal arrives.

mod atomic;
mod background;
mod chunks;
mod config;
mod direct;
mod error;
mod folders;
mod handlers;
mod hooks;
mod http;
mod identity;
mod logging;
mod merge;
mod metadata;
mod policy;
mod quota;
mod storage;
#[cfg(test)]
mod testing;
mod upload;

use axum::http::Request;
use axum::middleware;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::{Args, THUMBNAIL_QUEUE_CAPACITY};
use crate::hooks::{ChannelThumbnailQueue, Hooks, ListingGenerations, TracingAudit};
use crate::http::{build_cors_layer, client_ip};
use crate::storage::Storage;
use crate::upload::{UploadConfig, UploadService};

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;
    info!(root = %storage.root_path().display(), "storage ready");
    let store = metadata::connect(&args.database_url, args.database_max_connections)
        .await
        .map_err(|err| std::io::Error::other(err.to_string()))?;

    let (thumbnails, thumbnail_jobs) = ChannelThumbnailQueue::new(THUMBNAIL_QUEUE_CAPACITY);
    let hooks = Hooks {
        audit: Arc::new(TracingAudit),
        thumbnails: Arc::new(thumbnails),
        listings: Arc::new(ListingGenerations::default()),
    };
    let service = Arc::new(UploadService::new(
        store,
        storage,
        UploadConfig::from_args(&args),
        hooks,
    ));
    spawn_background_tasks(service.clone(), thumbnail_jobs);

    let mut app = handlers::api_router(service)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip = client_ip(request),
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        );

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    info!("🚀 Starting HTTP server at {}", http_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
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
}
