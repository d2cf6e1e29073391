use regex::Regex;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tokio::io::AsyncRead;

use crate::errors::{AppError, AppResult};
use crate::security::InputValidator;
use crate::storage::ObjectStorage;

/// Where a catalog item's binary payload lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    File(PathBuf),
    Object { bucket: String, key: String },
}

impl Locator {
    /// Parses `s3://bucket/key` or treats the input as a filesystem path.
    pub fn parse(source: &str) -> AppResult<Self> {
        let object_uri = Regex::new(r"^s3://([^/]+)/?(.*)$")
            .map_err(|e| AppError::Internal(format!("Invalid locator pattern: {}", e)))?;

        if let Some(captures) = object_uri.captures(source.trim()) {
            return Ok(Locator::Object {
                bucket: captures[1].to_string(),
                key: captures[2].to_string(),
            });
        }

        if source.trim().is_empty() {
            return Err(AppError::validation("locator", "Locator cannot be empty"));
        }

        Ok(Locator::File(PathBuf::from(source)))
    }

    /// Final path segment, used for MIME detection and the multipart file name.
    pub fn file_name(&self) -> String {
        let name = match self {
            Locator::File(path) => path.file_name().map(|n| n.to_string_lossy().to_string()),
            Locator::Object { key, .. } => key.rsplit('/').next().map(str::to_string),
        };
        name.unwrap_or_default()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(path) => write!(f, "{}", path.display()),
            Locator::Object { bucket, key } => write!(f, "s3://{}/{}", bucket, key),
        }
    }
}

/// A payload opened for streaming. `total_bytes` is what gets declared at
/// INIT; the reader must yield exactly that many bytes.
pub struct Payload {
    pub file_name: String,
    pub total_bytes: u64,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl Payload {
    pub fn new(
        file_name: impl Into<String>,
        total_bytes: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            total_bytes,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(file_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let total_bytes = data.len() as u64;
        Self::new(file_name, total_bytes, Cursor::new(data))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("file_name", &self.file_name)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

/// Opens payloads from the local filesystem or object storage.
#[derive(Debug, Clone, Default)]
pub struct PayloadStore {
    storage: ObjectStorage,
}

impl PayloadStore {
    pub fn new(storage: ObjectStorage) -> Self {
        Self { storage }
    }

    /// Payload size, read from metadata so oversized objects are never
    /// downloaded.
    pub async fn size(&self, locator: &Locator) -> AppResult<u64> {
        match locator {
            Locator::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            Locator::Object { bucket, key } => self.storage.size(bucket, key).await,
        }
    }

    pub async fn open(&self, locator: &Locator) -> AppResult<Payload> {
        match locator {
            Locator::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                let total_bytes = file.metadata().await?.len();
                Ok(Payload::new(locator.file_name(), total_bytes, file))
            }
            Locator::Object { bucket, key } => {
                let data = self.storage.fetch(bucket, key).await?;
                Ok(Payload::from_bytes(locator.file_name(), data.to_vec()))
            }
        }
    }

    /// Every supported image under a directory or an `s3://bucket/prefix`.
    pub async fn discover(&self, source: &str) -> AppResult<Vec<Locator>> {
        match Locator::parse(source)? {
            Locator::Object { bucket, key } => {
                let keys = self.storage.list_keys(&bucket, &key).await?;
                let total = keys.len();
                let locators: Vec<Locator> = keys
                    .into_iter()
                    .filter(|k| InputValidator::is_supported_image(k))
                    .map(|k| Locator::Object {
                        bucket: bucket.clone(),
                        key: k,
                    })
                    .collect();
                log::info!(
                    "Found {} images in s3://{}/{} ({} other objects skipped)",
                    locators.len(),
                    bucket,
                    key,
                    total - locators.len()
                );
                Ok(locators)
            }
            Locator::File(dir) => discover_directory(&dir),
        }
    }
}

fn discover_directory(dir: &Path) -> AppResult<Vec<Locator>> {
    if !dir.is_dir() {
        return Err(AppError::validation(
            "source",
            &format!("{} is not a directory", dir.display()),
        ));
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if path.is_file() && InputValidator::is_supported_image(&name) {
            paths.push(path);
        }
    }
    paths.sort();

    log::info!("Found {} images in {}", paths.len(), dir.display());
    Ok(paths.into_iter().map(Locator::File).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn object_uris_split_into_bucket_and_key() {
        let locator = Locator::parse("s3://photos/queue/cat.jpg").unwrap();
        assert_eq!(
            locator,
            Locator::Object {
                bucket: "photos".to_string(),
                key: "queue/cat.jpg".to_string(),
            }
        );
        assert_eq!(locator.file_name(), "cat.jpg");
        assert_eq!(locator.to_string(), "s3://photos/queue/cat.jpg");
    }

    #[test]
    fn bucket_without_prefix_parses() {
        assert_eq!(
            Locator::parse("s3://photos").unwrap(),
            Locator::Object {
                bucket: "photos".to_string(),
                key: String::new(),
            }
        );
    }

    #[test]
    fn plain_paths_are_files() {
        let locator = Locator::parse("/srv/images/dog.png").unwrap();
        assert_eq!(locator, Locator::File(PathBuf::from("/srv/images/dog.png")));
        assert_eq!(locator.file_name(), "dog.png");
        assert!(Locator::parse("  ").is_err());
    }

    #[tokio::test]
    async fn local_payload_declares_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixel.png");
        std::fs::write(&path, vec![7u8; 1234]).unwrap();

        let mut payload = PayloadStore::default()
            .open(&Locator::File(path))
            .await
            .unwrap();
        assert_eq!(payload.file_name, "pixel.png");
        assert_eq!(payload.total_bytes, 1234);

        let mut data = Vec::new();
        payload.reader.read_to_end(&mut data).await.unwrap();
        assert_eq!(data.len(), 1234);
    }

    #[tokio::test]
    async fn size_is_read_without_opening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.jpg");
        std::fs::write(&path, vec![0u8; 4096]).unwrap();

        let store = PayloadStore::default();
        assert_eq!(store.size(&Locator::File(path)).await.unwrap(), 4096);
        assert!(matches!(
            store.size(&Locator::File(dir.path().join("missing.jpg"))).await,
            Err(AppError::Io(_))
        ));
    }

    #[tokio::test]
    async fn directory_discovery_keeps_supported_images() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.jpg", "a.png", "notes.txt", "c.JPEG"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();

        let found = PayloadStore::default()
            .discover(&dir.path().to_string_lossy())
            .await
            .unwrap();
        let names: Vec<String> = found.iter().map(Locator::file_name).collect();
        assert_eq!(names, vec!["a.png", "b.jpg", "c.JPEG"]);
    }
}
