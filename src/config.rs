//! Configuration management for the rasterization gateway
//!
//! Everything comes from the environment. `STORAGE_BUCKET_REGION` maps
//! buckets onto regions with the shape `region:bucket[,bucket...];region:...`.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub signing: SigningConfig,
    pub file_cache: FileCacheConfig,
    pub raster: RasterConfig,
    pub artifact: Option<ArtifactConfig>,
    pub annotations: AnnotationConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub logging_level: String,
}

#[derive(Debug, Clone)]
pub struct SigningConfig {
    /// Empty secret disables verification (insecure mode).
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct FileCacheConfig {
    pub base_dir: PathBuf,
    pub size: usize,
    pub download_timeout: Duration,
    pub default_extension: String,
    /// Lower-cased request headers that participate in the cache key.
    pub header_whitelist: Vec<String>,
    /// bucket name -> region
    pub bucket_region: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RasterConfig {
    pub cache_size: usize,
    pub buffer_size: usize,
}

#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    pub bucket: String,
    /// 32-byte AES-256-GCM key.
    pub secret: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct AnnotationConfig {
    pub base_url: Option<String>,
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable '{0}' can't be empty")]
    Missing(&'static str),

    #[error("fail to parse '{0}': {1}")]
    Invalid(&'static str, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let secret = env::var("URL_SIGNING_SECRET").unwrap_or_default();

        let raw_bucket_region = env::var("STORAGE_BUCKET_REGION")
            .map_err(|_| ConfigError::Missing("STORAGE_BUCKET_REGION"))?;
        let bucket_region = parse_storage_bucket_region(&raw_bucket_region)
            .map_err(|e| ConfigError::Invalid("STORAGE_BUCKET_REGION", e))?;

        let artifact = match env::var("CACHE_BUCKET") {
            Ok(bucket) if !bucket.is_empty() => {
                let key = env::var("CACHE_SECRET").map_err(|_| ConfigError::Missing("CACHE_SECRET"))?;
                if key.len() != 32 {
                    return Err(ConfigError::Invalid(
                        "CACHE_SECRET",
                        format!("expected a 32-byte key, got {} bytes", key.len()),
                    ));
                }
                Some(ArtifactConfig {
                    bucket,
                    secret: key.into_bytes(),
                })
            }
            _ => None,
        };

        Ok(Config {
            server: ServerConfig {
                port: parse_or("HTTP_PORT", 8000)?,
                logging_level: env::var("LOGGING_LEVEL").unwrap_or_else(|_| "info".to_string()),
            },
            signing: SigningConfig { secret },
            file_cache: FileCacheConfig {
                base_dir: PathBuf::from(env::var("BASE_DIR").unwrap_or_else(|_| ".".to_string())),
                size: parse_or("CACHE_SIZE", 512)?,
                download_timeout: Duration::from_secs(parse_or("DOWNLOAD_TIMEOUT", 300)?),
                default_extension: env::var("DEFAULT_EXTENSION")
                    .unwrap_or_else(|_| ".pdf".to_string()),
                header_whitelist: env::var("DOWNLOAD_HEADER_WHITELIST")
                    .unwrap_or_else(|_| "authorization,dropbox-token".to_string())
                    .split(',')
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect(),
                bucket_region,
            },
            raster: RasterConfig {
                cache_size: parse_or("RASTER_CACHE_SIZE", 20)?,
                buffer_size: parse_or("RASTER_BUFFER_SIZE", 10)?,
            },
            artifact,
            annotations: AnnotationConfig {
                base_url: env::var("ANNOTATION_URL").ok().filter(|v| !v.is_empty()),
                font_path: env::var("ANNOTATION_FONT")
                    .ok()
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from),
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, e.to_string())),
        _ => Ok(default),
    }
}

/// Parse `region:bucket[,bucket...];region:...` into a bucket -> region map.
fn parse_storage_bucket_region(payload: &str) -> Result<HashMap<String, String>, String> {
    let mut result = HashMap::new();
    for segment in payload.split(';') {
        let (region, buckets) = segment
            .split_once(':')
            .ok_or_else(|| "invalid payload".to_string())?;
        let region = region.trim();
        if region.is_empty() {
            return Err("invalid payload".to_string());
        }
        for bucket in buckets.split(',') {
            let bucket = bucket.trim();
            if bucket.is_empty() {
                return Err("expected at least one bucket".to_string());
            }
            result.insert(bucket.to_string(), region.to_string());
        }
    }
    if result.is_empty() {
        return Err("fail to parse the storage bucket region".to_string());
    }
    Ok(result)
}
