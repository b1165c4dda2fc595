//! Document rendering endpoint
//!
//! `GET /documents/<path...>` renders a page or, when `page` is absent,
//! answers document metadata. The pipeline: validate parameters, verify the
//! URL signature, fetch the document through the file cache (annotation
//! image fan-out runs concurrently), short-circuit through the artifact
//! cache when possible, render, and shape the response.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{OriginalUri, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::annotations::{prepare_overlays, AnnotationError, TempFileGuard};
use crate::artifact::artifact_key;
use crate::error::{error_response, AppError};
use crate::fetch::FetchKey;
use crate::raster::{OutputFormat, PreparedOverlay, RenderJobSpec};
use crate::signing::{check_signature, SignatureCheck, SIGNING_BUCKET_SIZE};
use crate::state::AppState;

use super::gzip;
use super::middleware::RequestId;

/// Maximum supported output width in pixels.
const IMAGE_MAX_WIDTH: u32 = 4096;
/// Maximum scale override.
const IMAGE_MAX_SCALE: f64 = 3.0;
/// Maximum supported dots-per-inch.
const IMAGE_MAX_DPI: u32 = 600;

#[derive(Debug)]
struct RenderParams {
    /// 1-based page; absent means a metadata request.
    page: Option<usize>,
    width: u32,
    scale: f32,
    dpi: u32,
    quality: u8,
    format: OutputFormat,
    newer_than: Option<SystemTime>,
    token: Option<String>,
    bypass: bool,
}

fn query_map(query: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, value) in url::form_urlencoded::parse(query.unwrap_or("").as_bytes()) {
        map.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }
    map
}

/// Bounds are enforced before any I/O; the first offending field names the
/// error.
fn parse_params(query: &HashMap<String, String>) -> Result<RenderParams, AppError> {
    let page = match query.get("page") {
        Some(raw) => {
            let page: usize = raw
                .parse()
                .map_err(|_| AppError::Client("Invalid page!".to_string()))?;
            if page < 1 {
                return Err(AppError::Client("Invalid page!".to_string()));
            }
            Some(page)
        }
        None => None,
    };

    let width = match query.get("width") {
        Some(raw) => {
            let width: u32 = raw
                .parse()
                .map_err(|_| AppError::Client("Invalid width!".to_string()))?;
            if width > IMAGE_MAX_WIDTH {
                return Err(AppError::Client(format!(
                    "Invalid width! Limit is {IMAGE_MAX_WIDTH}"
                )));
            }
            width
        }
        None => 0,
    };

    let scale = match query.get("scale") {
        Some(raw) => {
            let scale: f64 = raw
                .parse()
                .map_err(|_| AppError::Client("Invalid scale!".to_string()))?;
            if !(0.0..=IMAGE_MAX_SCALE).contains(&scale) {
                return Err(AppError::Client(format!(
                    "Invalid scale! Limit is {IMAGE_MAX_SCALE}"
                )));
            }
            scale as f32
        }
        None => 0.0,
    };

    let dpi = match query.get("dpi") {
        Some(raw) => {
            let dpi: u32 = raw
                .parse()
                .map_err(|_| AppError::Client("Invalid dpi!".to_string()))?;
            if dpi > IMAGE_MAX_DPI {
                return Err(AppError::Client(format!(
                    "Invalid dpi! Limit is {IMAGE_MAX_DPI}"
                )));
            }
            dpi
        }
        None => 0,
    };

    let quality = match query.get("quality") {
        Some(raw) => {
            let quality: u8 = raw
                .parse()
                .map_err(|_| AppError::Client("Invalid quality!".to_string()))?;
            if !(1..=100).contains(&quality) {
                return Err(AppError::Client("Invalid quality!".to_string()));
            }
            quality
        }
        None => 100,
    };

    let format = match query.get("format").map(String::as_str) {
        Some("png") => OutputFormat::Png,
        Some("jpeg") => OutputFormat::Jpeg,
        Some("svg+xml") => OutputFormat::Svg,
        Some("html") => OutputFormat::Html,
        Some(_) => return Err(AppError::Client("Invalid format!".to_string())),
        // The older MIME-style selector; an unknown value falls back to PNG.
        None => match query.get("imageType").map(String::as_str) {
            Some("image/jpeg") => OutputFormat::Jpeg,
            Some("image/svg+xml") => OutputFormat::Svg,
            Some("image/png") | None => OutputFormat::Png,
            Some(other) => {
                warn!("got invalid imageType request: {other}; sending image/png");
                OutputFormat::Png
            }
        },
    };

    // Unparseable newerThan values are treated as absent.
    let newer_than = query
        .get("newerThan")
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));

    Ok(RenderParams {
        page,
        width,
        scale,
        dpi,
        quality,
        format,
        newer_than,
        token: query.get("token").cloned(),
        bypass: query.get("bypass").map(String::as_str) == Some("true"),
    })
}

#[derive(Serialize)]
struct DocumentMetadata {
    #[serde(rename = "Filename")]
    filename: String,
    #[serde(rename = "PageCount")]
    page_count: usize,
}

pub async fn handle_document(
    State(state): State<AppState>,
    Path(doc_path): Path<String>,
    OriginalUri(uri): OriginalUri,
    Extension(request_id): Extension<RequestId>,
    headers: HeaderMap,
) -> Response {
    match process_document(&state, &doc_path, &uri, &headers).await {
        Ok(response) => response,
        Err(err) => error_response(&err, &request_id.0),
    }
}

async fn process_document(
    state: &AppState,
    doc_path: &str,
    uri: &axum::http::Uri,
    headers: &HeaderMap,
) -> Result<Response, AppError> {
    let params = parse_params(&query_map(uri.query()))?;
    verify_signature(state, uri)?;

    let whitelist = &state.config().file_cache.header_whitelist;
    let header_pairs: Vec<(&str, &str)> = headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect();
    let key = FetchKey::from_request(doc_path, header_pairs, whitelist);

    // The document fetch and the annotation fan-out run concurrently; both
    // must succeed before rendering.
    let fetch = async {
        match params.newer_than {
            Some(t) => state.file_cache().fetch_newer_than(&key, t).await,
            None => state.file_cache().fetch(&key).await,
        }
        .map_err(AppError::from)
    };
    let annotations = fetch_overlays(state, &params);
    let (local_path, (overlays, _temp_guard)) = tokio::try_join!(fetch, annotations)?;

    let raster = state
        .raster_cache()
        .get_or_open(&local_path)
        .await
        .map_err(|err| {
            warn!(path = %local_path.display(), "unable to get rasterizer: {err}");
            AppError::from(err)
        })?;

    // No page parameter means a metadata request.
    let Some(page) = params.page else {
        let metadata = DocumentMetadata {
            filename: Uuid::new_v5(&Uuid::NAMESPACE_URL, doc_path.as_bytes()).to_string(),
            page_count: raster.page_count(),
        };
        return Ok(Json(metadata).into_response());
    };

    // Artifact-cache eligibility: plain PNG renders only. Overlays are
    // token-specific and dpi/quality are not part of the artifact key, so
    // anything else would alias distinct outputs.
    let cacheable = state.artifact_cache().is_some()
        && params.format == OutputFormat::Png
        && params.dpi == 0
        && overlays.is_empty();

    let mut payload_key = None;
    if cacheable {
        let payload = tokio::fs::read(&local_path)
            .await
            .map_err(|e| AppError::Internal(format!("fail to read the cached file: {e}")))?;
        let cache_key = artifact_key(&payload, page, params.width, params.scale);
        if let Some(cache) = state.artifact_cache() {
            match cache.get(&cache_key, params.bypass).await {
                Ok(Some(bytes)) => {
                    debug!(key = %cache_key, "artifact cache hit");
                    return Ok(shape_response(bytes, params.format, headers)?);
                }
                Ok(None) => {}
                Err(err) => warn!("artifact cache read failed: {err}"),
            }
        }
        payload_key = Some(cache_key);
    }

    let spec = RenderJobSpec {
        page: page - 1,
        width: params.width,
        scale: params.scale,
        dpi: params.dpi,
        quality: params.quality,
        format: params.format,
        overlays,
    };
    let rendered = Bytes::from(raster.render(spec).await?);

    if let (Some(cache), Some(cache_key)) = (state.artifact_cache(), payload_key) {
        cache.put_detached(cache_key, rendered.clone(), params.bypass);
    }

    Ok(shape_response(rendered, params.format, headers)?)
}

fn verify_signature(state: &AppState, uri: &axum::http::Uri) -> Result<(), AppError> {
    let secret = state.config().signing.secret.trim();
    if secret.is_empty() {
        return Ok(());
    }
    match check_signature(secret, SIGNING_BUCKET_SIZE, SystemTime::now(), &uri.to_string()) {
        SignatureCheck::Valid => Ok(()),
        SignatureCheck::Expired => Err(AppError::Unauthorized("token-ttl elapsed".to_string())),
        SignatureCheck::Invalid => Err(AppError::Forbidden),
    }
}

async fn fetch_overlays(
    state: &AppState,
    params: &RenderParams,
) -> Result<(Vec<PreparedOverlay>, TempFileGuard), AppError> {
    let (Some(client), Some(token), Some(page)) =
        (state.annotation_client(), &params.token, params.page)
    else {
        return Ok((Vec::new(), TempFileGuard::default()));
    };

    let annotations = client.fetch_for_token(token).await.map_err(annotation_err)?;
    if annotations.is_empty() {
        return Ok((Vec::new(), TempFileGuard::default()));
    }

    prepare_overlays(&annotations, page, state.http_downloader(), state.annotation_font())
        .await
        .map_err(annotation_err)
}

/// A render without its annotations would be semantically wrong, so
/// annotation failures fail the request.
fn annotation_err(err: AnnotationError) -> AppError {
    AppError::Internal(err.to_string())
}

fn shape_response(
    bytes: Bytes,
    format: OutputFormat,
    request_headers: &HeaderMap,
) -> Result<Response, AppError> {
    let mut response = Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    // Cache hints line up with the signing window; a URL outlives its
    // signature anyway, so longer-lived caching would be wasted.
    let max_age = SIGNING_BUCKET_SIZE.as_secs();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(&format!("max-age={max_age}"))
            .map_err(|e| AppError::Internal(e.to_string()))?,
    );

    let body = if format.is_vector() && gzip::supports_gzip(request_headers) {
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        gzip::compress(&bytes)
            .map_err(|e| AppError::Internal(format!("failed to gzip the response: {e}")))?
    } else {
        bytes
    };

    *response.body_mut() = Body::from(body);
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}
