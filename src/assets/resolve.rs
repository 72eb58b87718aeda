//! Image source strategies.
//!
//! The renderer never fetches bytes itself; it asks an [`ImageSource`] for a
//! decoded image. Two strategies exist because of where a render runs:
//! server-side renders fetch any URL directly, while renders hosted in a
//! browser-like context must route external URLs through a same-origin proxy
//! so the exported canvas is not tainted. A failed fetch or decode is an
//! explicit error; substituting a blank image would hide genuine failures
//! from the batch report.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    assets::decode::{PreparedImage, decode_data_uri, decode_image},
    foundation::error::{PinforgeError, PinforgeResult},
};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("pinforge/", env!("CARGO_PKG_VERSION"));

/// Strategy for turning an element's source string into a decoded image.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn load(&self, src: &str) -> PinforgeResult<PreparedImage>;
}

/// Server-side strategy: fetch remote bytes directly and decode inline.
///
/// No cross-origin restriction exists here, so http(s) URLs are fetched
/// as-is with a bounded timeout.
pub struct DirectImageSource {
    client: reqwest::Client,
}

impl DirectImageSource {
    pub fn new() -> PinforgeResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| PinforgeError::image(format!("http client error: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch(&self, url: &str) -> PinforgeResult<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PinforgeError::image(format!("failed to download {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(PinforgeError::image(format!(
                "failed to download {url}: HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PinforgeError::image(format!("failed to read image data: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl ImageSource for DirectImageSource {
    async fn load(&self, src: &str) -> PinforgeResult<PreparedImage> {
        let src = src.trim();
        if src.is_empty() {
            return Err(PinforgeError::image("image element has no source"));
        }
        if src.starts_with("data:") {
            return decode_image(&decode_data_uri(src)?);
        }
        if src.starts_with("http://") || src.starts_with("https://") {
            return decode_image(&self.fetch(src).await?);
        }
        Err(PinforgeError::image(format!(
            "unsupported image source scheme: '{src}'"
        )))
    }
}

/// Browser-context strategy: rewrite external URLs through a same-origin
/// proxy endpoint before fetching. Data URIs need no rewrite.
pub struct ProxyImageSource {
    inner: DirectImageSource,
    proxy_base: String,
}

impl ProxyImageSource {
    pub fn new(proxy_base: impl Into<String>) -> PinforgeResult<Self> {
        Ok(Self {
            inner: DirectImageSource::new()?,
            proxy_base: proxy_base.into(),
        })
    }

    fn proxied_url(&self, src: &str) -> String {
        let encoded: String = url::form_urlencoded::byte_serialize(src.as_bytes()).collect();
        format!("{}?url={encoded}", self.proxy_base)
    }
}

#[async_trait]
impl ImageSource for ProxyImageSource {
    async fn load(&self, src: &str) -> PinforgeResult<PreparedImage> {
        let src = src.trim();
        if src.starts_with("data:") {
            return self.inner.load(src).await;
        }
        if src.starts_with("http://") || src.starts_with("https://") {
            return self.inner.load(&self.proxied_url(src)).await;
        }
        self.inner.load(src).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_source_is_an_error() {
        let source = DirectImageSource::new().unwrap();
        assert!(source.load("").await.is_err());
        assert!(source.load("   ").await.is_err());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_an_error() {
        let source = DirectImageSource::new().unwrap();
        assert!(source.load("ftp://example.com/a.png").await.is_err());
        assert!(source.load("/relative/path.png").await.is_err());
    }

    #[test]
    fn proxy_rewrites_and_escapes() {
        let source = ProxyImageSource::new("http://localhost:8080/api/proxy-image").unwrap();
        let url = source.proxied_url("https://cdn.example.com/a b.png?x=1&y=2");
        assert!(url.starts_with("http://localhost:8080/api/proxy-image?url="));
        assert!(url.contains("https%3A%2F%2Fcdn.example.com"));
        // Query separators inside the target URL must be escaped.
        assert!(url.contains("%26"));
    }
}
