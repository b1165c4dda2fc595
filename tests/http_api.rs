//! End-to-end tests over the HTTP surface
//!
//! The origin and the render engine are stubbed; everything between the
//! router and those seams is real: parameter validation, URL signing, the
//! single-flight file cache, the rasterizer cache and response shaping.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use raster_gateway::config::{
    AnnotationConfig, Config, FileCacheConfig, RasterConfig, ServerConfig, SigningConfig,
};
use raster_gateway::fetch::{DownloadError, Downloader, FetchKey, FileCache, HttpDownloader};
use raster_gateway::raster::{
    OutputFormat, RasterCache, RenderBackend, RenderError, RenderJobSpec, RenderedDocument,
};
use raster_gateway::routes::router;
use raster_gateway::signing::{generate_token, SIGNING_BUCKET_SIZE};
use raster_gateway::state::AppState;

const SECRET: &str = "test-signing-secret";
const PAGE_COUNT: usize = 2;

struct CountingDownloader {
    calls: AtomicUsize,
}

#[async_trait]
impl Downloader for CountingDownloader {
    async fn fetch(&self, key: &FetchKey, dest: &Path) -> Result<(), DownloadError> {
        if key.path().contains("missing") {
            return Err(DownloadError::NotFound);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::create_dir_all(dest.parent().unwrap())
            .await
            .unwrap();
        let mut payload = b"%PDF-1.4 fixture ".to_vec();
        payload.resize(4096, b'x');
        tokio::fs::write(dest, payload).await.unwrap();
        Ok(())
    }
}

struct StubBackend;

struct StubDocument;

impl RenderBackend for StubBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn RenderedDocument>, RenderError> {
        if !path.exists() {
            return Err(RenderError::Engine("document file is gone".to_string()));
        }
        Ok(Box::new(StubDocument))
    }
}

impl RenderedDocument for StubDocument {
    fn page_count(&self) -> usize {
        PAGE_COUNT
    }

    fn render_page(&self, spec: &RenderJobSpec) -> Result<Vec<u8>, RenderError> {
        if spec.page >= PAGE_COUNT {
            return Err(RenderError::BadPage);
        }
        match spec.format {
            OutputFormat::Svg => Ok(b"<svg xmlns=\"http://www.w3.org/2000/svg\"><rect/></svg>"
                .repeat(40)),
            OutputFormat::Html => Ok(b"<html><body>page</body></html>".to_vec()),
            _ => {
                let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
                bytes.resize(2048, 0u8);
                Ok(bytes)
            }
        }
    }
}

struct Harness {
    app: Router,
    downloader: Arc<CountingDownloader>,
    _dir: TempDir,
}

fn harness() -> Harness {
    harness_with_secret(SECRET)
}

fn harness_with_secret(secret: &str) -> Harness {
    let dir = TempDir::new().unwrap();
    let config = Config {
        server: ServerConfig {
            port: 0,
            logging_level: "error".to_string(),
        },
        signing: SigningConfig {
            secret: secret.to_string(),
        },
        file_cache: FileCacheConfig {
            base_dir: dir.path().to_path_buf(),
            size: 16,
            download_timeout: Duration::from_secs(5),
            default_extension: ".pdf".to_string(),
            header_whitelist: vec!["authorization".to_string(), "dropbox-token".to_string()],
            bucket_region: [("bucket-a".to_string(), "us-west-1".to_string())]
                .into_iter()
                .collect(),
        },
        raster: RasterConfig {
            cache_size: 8,
            buffer_size: 4,
        },
        artifact: None,
        annotations: AnnotationConfig::default(),
    };

    let downloader = Arc::new(CountingDownloader {
        calls: AtomicUsize::new(0),
    });
    let file_cache = FileCache::new(
        config.file_cache.size,
        dir.path(),
        ".pdf",
        config.file_cache.download_timeout,
        downloader.clone(),
    );
    let raster_cache = RasterCache::new(
        config.raster.cache_size,
        config.raster.buffer_size,
        Arc::new(StubBackend),
    );
    {
        let raster_cache = raster_cache.clone();
        file_cache.set_on_evict(Box::new(move |_key, path| raster_cache.remove(path)));
    }

    let state = AppState::new(
        config,
        file_cache,
        raster_cache,
        None,
        None,
        None,
        Arc::new(HttpDownloader::new(reqwest::Client::new())),
    );

    Harness {
        app: router(state),
        downloader,
        _dir: dir,
    }
}

fn signed(url: &str) -> String {
    let token = generate_token(SECRET, SIGNING_BUCKET_SIZE, SystemTime::now(), url);
    format!("{url}&token={token}")
}

async fn get(app: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, body.to_vec())
}

#[tokio::test]
async fn renders_a_signed_page_request() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=1");
    let (status, headers, body) = get(&h.app, &uri).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "image/png");
    assert!(body.len() > 1024);
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_identical_request_skips_the_download() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=1");

    let (status, _, first) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, second) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(first, second);
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn out_of_range_page_is_not_found() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=10");
    let (status, _, body) = get(&h.app, &uri).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(String::from_utf8_lossy(&body).contains("page not found"));
}

#[tokio::test]
async fn negative_width_is_a_client_error() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=1&width=-300");
    let (status, _, body) = get(&h.app, &uri).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("Invalid width"));
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bad_token_is_forbidden() {
    let h = harness();
    let (status, _, _) = get(
        &h.app,
        "/documents/bucket-a/sample.pdf?page=1&token=deadbeef",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_token_ttl_is_unauthorized() {
    let h = harness();
    let past = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        - 3600;
    let uri = signed(&format!(
        "/documents/bucket-a/sample.pdf?page=1&token-ttl={past}"
    ));
    let (status, _, _) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn missing_signature_runs_insecure_when_unconfigured() {
    let h = harness_with_secret("");
    let (status, _, _) = get(&h.app, "/documents/bucket-a/sample.pdf?page=1").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn metadata_request_reports_page_count() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?token-ttl=99999999999");
    let (status, headers, body) = get(&h.app, &uri).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let metadata: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(metadata["PageCount"], PAGE_COUNT);
    let filename = metadata["Filename"].as_str().unwrap().to_string();

    // The generated identifier is stable rather than the source path.
    assert!(!filename.contains("sample.pdf"));
    let (_, _, body) = get(&h.app, &uri).await;
    let again: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(again["Filename"].as_str().unwrap(), filename);
}

#[tokio::test]
async fn newer_than_busts_the_cache() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=1");
    let (status, _, _) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 1);

    let future = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;
    let uri = signed(&format!(
        "/documents/bucket-a/sample.pdf?page=1&newerThan={future}"
    ));
    let (status, _, _) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn changed_whitelisted_header_downloads_fresh() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=1");

    for bearer in ["Bearer alpha", "Bearer beta"] {
        let response = h
            .app
            .clone()
            .oneshot(
                Request::get(uri.as_str())
                    .header(header::AUTHORIZATION, bearer)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 2);

    // A header outside the whitelist does not fragment the cache.
    let response = h
        .app
        .clone()
        .oneshot(
            Request::get(uri.as_str())
                .header(header::AUTHORIZATION, "Bearer alpha")
                .header(header::ACCEPT, "image/png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.downloader.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn missing_document_is_not_found() {
    let h = harness();
    let uri = signed("/documents/bucket-a/missing.pdf?page=1");
    let (status, _, _) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn svg_gzips_only_when_the_client_asks() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=1&format=svg%2Bxml");

    // Plain request: raw SVG.
    let (status, headers, raw) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get(header::CONTENT_TYPE).unwrap(),
        "image/svg+xml"
    );
    assert!(headers.get(header::CONTENT_ENCODING).is_none());
    assert!(raw.starts_with(b"<svg"));

    // gzip advertised: wrapped body that gunzips back to the raw SVG.
    let response = h
        .app
        .clone()
        .oneshot(
            Request::get(uri.as_str())
                .header(header::ACCEPT_ENCODING, "gzip")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_ENCODING).unwrap(),
        "gzip"
    );
    assert_eq!(
        response.headers().get(header::VARY).unwrap(),
        "Accept-Encoding"
    );
    let compressed = response.into_body().collect().await.unwrap().to_bytes();
    let mut decoder = flate2::read::GzDecoder::new(compressed.as_ref());
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed).unwrap();
    assert_eq!(decompressed, raw);
}

#[tokio::test]
async fn health_answers_healthy() {
    let h = harness();
    let (status, _, body) = get(&h.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(payload["status"], "healthy");
}

#[tokio::test]
async fn filecache_list_tracks_loaded_rasterizers() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=1");
    let (status, _, _) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = get(&h.app, "/filecache/list").await;
    assert_eq!(status, StatusCode::OK);
    let entries: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert_eq!(entries[0]["Path"], "bucket-a/sample.pdf");
    assert_eq!(entries[0]["LoadedInMemory"], true);

    // Purging the raster cache flips the in-memory flag.
    let response = h
        .app
        .clone()
        .oneshot(
            Request::post("/rastercache/purge")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, _, body) = get(&h.app, "/filecache/list").await;
    let entries: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(entries[0]["LoadedInMemory"], false);
}

#[tokio::test]
async fn cors_preflight_echoes_requested_headers() {
    let h = harness();
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/documents/bucket-a/sample.pdf")
                .header("access-control-request-headers", "authorization")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "GET, OPTIONS"
    );
    assert_eq!(
        headers.get("access-control-allow-headers").unwrap(),
        "authorization"
    );
}

#[tokio::test]
async fn document_responses_carry_cors_and_cache_headers() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=1");
    let (status, headers, _) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    let cache_control = headers.get(header::CACHE_CONTROL).unwrap().to_str().unwrap();
    assert!(cache_control.starts_with("max-age="));
}

#[tokio::test]
async fn error_bodies_carry_a_correlation_id() {
    let h = harness();
    let uri = signed("/documents/bucket-a/sample.pdf?page=1&width=-1");
    let (status, headers, body) = get(&h.app, &uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let detail = payload["error"]["detail"].as_str().unwrap();
    let request_id = headers.get("x-request-id").unwrap().to_str().unwrap();
    assert!(detail.contains(request_id));
}

#[tokio::test]
async fn oversized_declared_payloads_are_rejected() {
    let h = harness();
    let response = h
        .app
        .clone()
        .oneshot(
            Request::post("/rastercache/purge")
                .header(header::CONTENT_LENGTH, "9999999")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}
