//! Rasterization gateway server
//!
//! Bootstraps the fetch/cache pipeline and serves the HTTP API. Shuts down
//! on SIGINT/SIGTERM with a best-effort cache purge inside a 10 second
//! budget, exiting 130 the way an interrupted process should.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ab_glyph::FontVec;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use raster_gateway::annotations::AnnotationClient;
use raster_gateway::artifact::{ArtifactCache, Cipher, S3ArtifactStore};
use raster_gateway::config::Config;
use raster_gateway::fetch::{FileCache, HttpDownloader, ObjectStoreDownloader, OriginDownloader};
use raster_gateway::raster::{engine::MupdfBackend, RasterCache};
use raster_gateway::routes;
use raster_gateway::state::AppState;

/// Budget for the shutdown purge.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

fn fatal(message: &str) -> ! {
    tracing::error!("{message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to parse the configuration parameters: {err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("raster_gateway={}", config.server.logging_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting raster-gateway v{}", env!("CARGO_PKG_VERSION"));
    if config.signing.secret.trim().is_empty() {
        tracing::warn!("no URL signing secret was passed... running in insecure mode!");
    }

    let shared = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let http_client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
    {
        Ok(client) => client,
        Err(err) => fatal(&format!("fail to build the HTTP client: {err}")),
    };
    let http_downloader = Arc::new(HttpDownloader::new(http_client.clone()));

    let downloader = OriginDownloader::new(
        ObjectStoreDownloader::new(&shared, config.file_cache.bucket_region.clone()),
        HttpDownloader::new(http_client.clone()),
        vec!["dropbox".to_string()],
    );
    let file_cache = FileCache::new(
        config.file_cache.size,
        config.file_cache.base_dir.clone(),
        config.file_cache.default_extension.clone(),
        config.file_cache.download_timeout,
        Arc::new(downloader),
    );

    let raster_cache = RasterCache::new(
        config.raster.cache_size,
        config.raster.buffer_size,
        Arc::new(MupdfBackend::new()),
    );

    // A rasterizer holding an evicted file must let go before the file cache
    // deletes it from disk.
    {
        let raster_cache = raster_cache.clone();
        file_cache.set_on_evict(Box::new(move |_key, path| {
            raster_cache.remove(path);
        }));
    }

    let artifact_cache = match &config.artifact {
        Some(artifact) => {
            let store = S3ArtifactStore::new(&shared, artifact.bucket.clone());
            match Cipher::new(&artifact.secret, Arc::new(store)) {
                Ok(cipher) => {
                    tracing::info!(bucket = %artifact.bucket, "artifact cache enabled");
                    Some(ArtifactCache::new(Arc::new(cipher)))
                }
                Err(err) => fatal(&format!("fail to initialize the artifact cipher: {err}")),
            }
        }
        None => None,
    };

    let annotation_client = config
        .annotations
        .base_url
        .as_ref()
        .map(|base| AnnotationClient::new(base.clone(), http_client.clone()));

    let annotation_font = match &config.annotations.font_path {
        Some(path) => match std::fs::read(path).map(FontVec::try_from_vec) {
            Ok(Ok(font)) => Some(Arc::new(font)),
            Ok(Err(err)) => fatal(&format!("fail to parse the annotation font: {err}")),
            Err(err) => fatal(&format!("fail to read the annotation font: {err}")),
        },
        None => None,
    };

    let state = AppState::new(
        config.clone(),
        file_cache.clone(),
        raster_cache.clone(),
        artifact_cache,
        annotation_client,
        annotation_font,
        http_downloader,
    );

    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("raster-gateway listening on {addr}");
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => fatal(&format!("unable to bind {addr}: {err}")),
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        fatal(&format!("unable to serve http: {err}"));
    }

    // Best-effort cleanup of the disk cache and open rasterizers.
    tracing::info!("clean shutdown initiated... waiting");
    raster_cache.purge();
    let purge_done = file_cache.purge_async();
    if tokio::time::timeout(SHUTDOWN_BUDGET, purge_done).await.is_err() {
        tracing::warn!("file cache purge did not finish within the shutdown budget");
    }

    std::process::exit(130);
}

/// Resolves on SIGINT or SIGTERM.
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
        _ = ctrl_c => {
            tracing::warn!("received Ctrl+C, attempting clean shutdown");
        },
        _ = terminate => {
            tracing::warn!("received SIGTERM, attempting clean shutdown");
        },
    }
}
