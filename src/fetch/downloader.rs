//! Origin downloaders
//!
//! Three strategies, selected by the shape of the logical path:
//! object-store (`<bucket>/<key>` or `s3://bucket/key`), raw HTTP
//! (`http(s)://...`), and base64 indirection (`dropbox/<base64-url>`). All of
//! them stream into `<dest>.partial-<uuid>` and rename into place so a
//! crashed download never leaves a half-written cache file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::{DownloadError, Downloader, FetchKey};

/// Where a logical path resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    ObjectStore { bucket: String, key: String },
    Http { url: String },
    Indirection { prefix: String, url: String },
}

impl Origin {
    /// Classify a logical path by its prefix.
    pub fn classify(path: &str, indirection_prefixes: &[String]) -> Result<Origin, DownloadError> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Ok(Origin::Http {
                url: path.to_string(),
            });
        }

        let stripped = path.strip_prefix("s3://").unwrap_or(path);
        let (first, rest) = stripped
            .split_once('/')
            .ok_or_else(|| DownloadError::Client(format!("invalid path '{path}'")))?;
        if first.is_empty() || rest.is_empty() {
            return Err(DownloadError::Client(format!("invalid path '{path}'")));
        }

        if indirection_prefixes.iter().any(|p| p == first) {
            let url = decode_indirection(rest)?;
            return Ok(Origin::Indirection {
                prefix: first.to_string(),
                url,
            });
        }

        Ok(Origin::ObjectStore {
            bucket: first.to_string(),
            key: rest.to_string(),
        })
    }
}

/// Decode a URL-safe base64 payload (with or without padding) into an
/// absolute URL.
fn decode_indirection(payload: &str) -> Result<String, DownloadError> {
    let bytes = URL_SAFE
        .decode(payload)
        .or_else(|_| URL_SAFE_NO_PAD.decode(payload))
        .map_err(|e| DownloadError::Client(format!("invalid indirection payload: {e}")))?;
    let url = String::from_utf8(bytes)
        .map_err(|_| DownloadError::Client("indirection payload is not UTF-8".to_string()))?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(DownloadError::Client(format!(
            "indirection payload is not an absolute URL: '{url}'"
        )));
    }
    Ok(url)
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(&format!(".partial-{}", Uuid::new_v4()));
    dest.with_file_name(name)
}

async fn prepare_dest(dest: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::Fatal(format!("could not create cache directory: {e}")))?;
    }
    Ok(())
}

async fn install(partial: &Path, dest: &Path) -> Result<(), DownloadError> {
    tokio::fs::rename(partial, dest)
        .await
        .map_err(|e| DownloadError::Fatal(format!("could not install downloaded file: {e}")))
}

async fn discard(partial: &Path) {
    let _ = tokio::fs::remove_file(partial).await;
}

/// Plain HTTP GET downloader. 404 maps to `NotFound`, any other non-success
/// status is `Fatal`.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        HttpDownloader { client }
    }

    /// Stream `url` to `dest`, sending `headers` along with the request.
    pub async fn download_url(
        &self,
        url: &str,
        headers: &[(String, String)],
        dest: &Path,
    ) -> Result<(), DownloadError> {
        prepare_dest(dest).await?;

        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::Transient(format!("request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => return Err(DownloadError::NotFound),
            status => {
                return Err(DownloadError::Fatal(format!(
                    "origin answered HTTP {status}"
                )))
            }
        }

        let partial = partial_path(dest);
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| DownloadError::Fatal(format!("could not create local file: {e}")))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    discard(&partial).await;
                    return Err(DownloadError::Transient(format!("read failed: {e}")));
                }
            };
            if let Err(e) = file.write_all(&chunk).await {
                discard(&partial).await;
                return Err(DownloadError::Fatal(format!("write failed: {e}")));
            }
        }
        if let Err(e) = file.flush().await {
            discard(&partial).await;
            return Err(DownloadError::Fatal(format!("flush failed: {e}")));
        }
        drop(file);

        install(&partial, dest).await
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, key: &FetchKey, dest: &Path) -> Result<(), DownloadError> {
        self.download_url(key.path(), &[], dest).await
    }
}

/// Downloader against the configured object-store buckets, one client per
/// region.
pub struct ObjectStoreDownloader {
    clients: HashMap<String, aws_sdk_s3::Client>,
    bucket_region: HashMap<String, String>,
}

impl ObjectStoreDownloader {
    pub fn new(shared: &aws_config::SdkConfig, bucket_region: HashMap<String, String>) -> Self {
        let mut clients = HashMap::new();
        for region in bucket_region.values() {
            if clients.contains_key(region) {
                continue;
            }
            let conf = aws_sdk_s3::config::Builder::from(shared)
                .region(Region::new(region.clone()))
                .build();
            clients.insert(region.clone(), aws_sdk_s3::Client::from_conf(conf));
        }
        ObjectStoreDownloader {
            clients,
            bucket_region,
        }
    }

    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> Result<(), DownloadError> {
        let region = self.bucket_region.get(bucket).ok_or_else(|| {
            DownloadError::Client(format!("no region configured for bucket '{bucket}'"))
        })?;
        let client = self
            .clients
            .get(region)
            .ok_or_else(|| DownloadError::Fatal(format!("no client for region '{region}'")))?;

        debug!(bucket, key, "downloading from object store");
        prepare_dest(dest).await?;

        let output = match client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(err) => {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    return Err(DownloadError::NotFound);
                }
                return Err(DownloadError::Fatal(format!(
                    "fail to get object '{bucket}/{key}': {service}"
                )));
            }
        };

        let partial = partial_path(dest);
        let mut file = tokio::fs::File::create(&partial)
            .await
            .map_err(|e| DownloadError::Fatal(format!("could not create local file: {e}")))?;

        let mut body = output.body;
        loop {
            match body.try_next().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        discard(&partial).await;
                        return Err(DownloadError::Fatal(format!("write failed: {e}")));
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    discard(&partial).await;
                    return Err(DownloadError::Transient(format!("read failed: {e}")));
                }
            }
        }
        if let Err(e) = file.flush().await {
            discard(&partial).await;
            return Err(DownloadError::Fatal(format!("flush failed: {e}")));
        }
        drop(file);

        install(&partial, dest).await
    }
}

#[async_trait]
impl Downloader for ObjectStoreDownloader {
    async fn fetch(&self, key: &FetchKey, dest: &Path) -> Result<(), DownloadError> {
        match Origin::classify(key.path(), &[])? {
            Origin::ObjectStore { bucket, key } => self.download(&bucket, &key, dest).await,
            _ => Err(DownloadError::Client(format!(
                "not an object-store path: '{}'",
                key.path()
            ))),
        }
    }
}

/// Dispatching downloader selecting a strategy by path prefix.
pub struct OriginDownloader {
    object_store: ObjectStoreDownloader,
    http: HttpDownloader,
    indirection_prefixes: Vec<String>,
}

impl OriginDownloader {
    pub fn new(
        object_store: ObjectStoreDownloader,
        http: HttpDownloader,
        indirection_prefixes: Vec<String>,
    ) -> Self {
        OriginDownloader {
            object_store,
            http,
            indirection_prefixes,
        }
    }

    /// Credential headers forwarded to an indirected origin. A bare
    /// `dropbox-token` argument is promoted to a bearer header.
    fn indirection_headers(key: &FetchKey) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if let Some(auth) = key.args().get("authorization") {
            headers.push(("authorization".to_string(), auth.clone()));
        } else if let Some(token) = key.args().get("dropbox-token") {
            headers.push(("authorization".to_string(), format!("Bearer {token}")));
        }
        headers
    }
}

#[async_trait]
impl Downloader for OriginDownloader {
    async fn fetch(&self, key: &FetchKey, dest: &Path) -> Result<(), DownloadError> {
        match Origin::classify(key.path(), &self.indirection_prefixes)? {
            Origin::ObjectStore { bucket, key: object } => {
                self.object_store.download(&bucket, &object, dest).await
            }
            Origin::Http { url } => self.http.download_url(&url, &[], dest).await,
            Origin::Indirection { url, .. } => {
                let headers = Self::indirection_headers(key);
                self.http.download_url(&url, &headers, dest).await
            }
        }
    }
}
