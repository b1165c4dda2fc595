//! Object-store backends for the artifact cache

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use super::ArtifactError;

/// Storage seam the cipher and cache layer stack onto.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `None` when the object does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, ArtifactError>;
    async fn put(&self, key: &str, payload: Bytes) -> Result<(), ArtifactError>;
}

pub struct S3ArtifactStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub fn new(shared: &aws_config::SdkConfig, bucket: impl Into<String>) -> Self {
        S3ArtifactStore {
            client: aws_sdk_s3::Client::new(shared),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ArtifactStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, ArtifactError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(err) => {
                let service = err.into_service_error();
                if service.is_no_such_key() {
                    return Ok(None);
                }
                return Err(ArtifactError::Store(format!(
                    "fail to fetch the object at the key '{key}': {service}"
                )));
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| ArtifactError::Store(format!("fail to read the object body: {e}")))?;
        Ok(Some(data.into_bytes()))
    }

    async fn put(&self, key: &str, payload: Bytes) -> Result<(), ArtifactError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(payload.to_vec()))
            .send()
            .await
            .map_err(|e| {
                ArtifactError::Store(format!("fail to put the object at the key '{key}': {e}"))
            })?;
        Ok(())
    }
}
