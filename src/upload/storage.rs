use std::path::PathBuf;

use async_trait::async_trait;

use crate::foundation::error::{PinforgeError, PinforgeResult};

/// Storage collaborator: persists one rendered pin and returns its public
/// URL. Assumed idempotent-safe to retry, but never retried by the batch
/// core; a failed upload fails that row only.
#[async_trait]
pub trait StorageUploader: Send + Sync {
    async fn upload(&self, bytes: &[u8], key: &str) -> PinforgeResult<String>;
}

/// Uploads via HTTP PUT to `{upload_base}/{key}` (S3-style presigned base or
/// any dumb blob endpoint) and reports `{public_base}/{key}` back.
pub struct HttpPutUploader {
    client: reqwest::Client,
    upload_base: String,
    public_base: String,
}

impl HttpPutUploader {
    pub fn new(upload_base: impl Into<String>, public_base: impl Into<String>) -> PinforgeResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pinforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PinforgeError::upload(format!("http client error: {e}")))?;
        Ok(Self {
            client,
            upload_base: trim_slash(upload_base.into()),
            public_base: trim_slash(public_base.into()),
        })
    }
}

fn trim_slash(mut s: String) -> String {
    while s.ends_with('/') {
        s.pop();
    }
    s
}

#[async_trait]
impl StorageUploader for HttpPutUploader {
    async fn upload(&self, bytes: &[u8], key: &str) -> PinforgeResult<String> {
        let url = format!("{}/{key}", self.upload_base);
        let content_type = mime_guess::from_path(key).first_or_octet_stream();

        let response = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type.as_ref())
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| PinforgeError::upload(format!("PUT {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(PinforgeError::upload(format!(
                "PUT {url} failed: HTTP {}",
                response.status()
            )));
        }
        Ok(format!("{}/{key}", self.public_base))
    }
}

/// Writes pins into a local directory; the CLI's storage backend.
pub struct DirUploader {
    root: PathBuf,
}

impl DirUploader {
    pub fn new(root: impl Into<PathBuf>) -> PinforgeResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| {
            PinforgeError::upload(format!("create output dir '{}': {e}", root.display()))
        })?;
        Ok(Self { root })
    }
}

#[async_trait]
impl StorageUploader for DirUploader {
    async fn upload(&self, bytes: &[u8], key: &str) -> PinforgeResult<String> {
        let path = self.root.join(key);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PinforgeError::upload(format!("write '{}': {e}", path.display())))?;
        Ok(path.display().to_string())
    }
}

/// In-memory test double recording every uploaded key.
#[derive(Default)]
pub struct MemoryUploader {
    uploads: std::sync::Mutex<Vec<(String, usize)>>,
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.uploads
            .lock()
            .map(|u| u.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.uploads.lock().map(|u| u.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StorageUploader for MemoryUploader {
    async fn upload(&self, bytes: &[u8], key: &str) -> PinforgeResult<String> {
        if bytes.is_empty() {
            return Err(PinforgeError::upload("refusing to store empty buffer"));
        }
        self.uploads
            .lock()
            .map_err(|_| PinforgeError::upload("uploader lock poisoned"))?
            .push((key.to_string(), bytes.len()));
        Ok(format!("memory://{key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dir_uploader_writes_and_reports_path() {
        let dir = std::env::temp_dir().join(format!("pinforge-test-{}", uuid::Uuid::new_v4()));
        let uploader = DirUploader::new(&dir).unwrap();
        let url = uploader.upload(b"abc", "pin-0.jpg").await.unwrap();
        assert!(url.ends_with("pin-0.jpg"));
        assert_eq!(std::fs::read(dir.join("pin-0.jpg")).unwrap(), b"abc");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn memory_uploader_records_keys() {
        let uploader = MemoryUploader::new();
        uploader.upload(b"x", "a.jpg").await.unwrap();
        uploader.upload(b"y", "b.jpg").await.unwrap();
        assert_eq!(uploader.keys(), vec!["a.jpg".to_string(), "b.jpg".to_string()]);
    }

    #[test]
    fn base_urls_are_normalized() {
        let up = HttpPutUploader::new("https://store.example.com/bucket/", "https://cdn.example.com/").unwrap();
        assert_eq!(up.upload_base, "https://store.example.com/bucket");
        assert_eq!(up.public_base, "https://cdn.example.com");
    }
}
