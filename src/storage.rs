use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt, PutPayload};
use std::time::Instant;

use crate::errors::AppResult;

/// S3-compatible object storage. Credentials come from the standard AWS
/// environment variables; region and endpoint can be pinned from config.
#[derive(Debug, Clone, Default)]
pub struct ObjectStorage {
    region: Option<String>,
    endpoint: Option<String>,
}

impl ObjectStorage {
    pub fn new(region: Option<String>, endpoint: Option<String>) -> Self {
        Self { region, endpoint }
    }

    fn bucket(&self, bucket: &str) -> AppResult<AmazonS3> {
        let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

        if let Some(ref region) = self.region {
            builder = builder.with_region(region.clone());
        }

        if let Some(ref endpoint) = self.endpoint {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        Ok(builder.build()?)
    }

    pub async fn fetch(&self, bucket: &str, key: &str) -> AppResult<Bytes> {
        let start = Instant::now();
        let store = self.bucket(bucket)?;
        let location = Path::from(key.to_string());

        let bytes = store.get(&location).await?.bytes().await?;

        log::debug!(
            "Fetched s3://{}/{} ({} bytes) in {:?}",
            bucket,
            key,
            bytes.len(),
            start.elapsed()
        );
        Ok(bytes)
    }

    /// Object size from a HEAD request, without fetching the body.
    pub async fn size(&self, bucket: &str, key: &str) -> AppResult<u64> {
        let store = self.bucket(bucket)?;
        let meta = store.head(&Path::from(key.to_string())).await?;
        Ok(meta.size)
    }

    pub async fn store(&self, bucket: &str, key: &str, data: Bytes) -> AppResult<()> {
        let start = Instant::now();
        let store = self.bucket(bucket)?;
        let location = Path::from(key.to_string());
        let size = data.len();

        store.put(&location, PutPayload::from(data)).await?;

        log::debug!(
            "Stored s3://{}/{} ({} bytes) in {:?}",
            bucket,
            key,
            size,
            start.elapsed()
        );
        Ok(())
    }

    /// Object keys under `prefix`, excluding directory placeholders.
    pub async fn list_keys(&self, bucket: &str, prefix: &str) -> AppResult<Vec<String>> {
        let store = self.bucket(bucket)?;
        let prefix = (!prefix.is_empty()).then(|| Path::from(prefix.to_string()));

        let objects: Vec<_> = store.list(prefix.as_ref()).try_collect().await?;

        let mut keys: Vec<String> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| !key.ends_with('/'))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
