use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    assets::resolve::DirectImageSource,
    foundation::error::{PinforgeError, PinforgeResult},
    render::{renderer::TemplateRenderer, text::TextEngine},
    upload::storage::{DirUploader, HttpPutUploader, StorageUploader},
};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Directory of .ttf/.otf/.ttc files registered at startup.
    pub fonts_dir: Option<PathBuf>,
    /// PUT base for rendered pins; when unset, pins land in `output_dir`.
    pub storage_url: Option<String>,
    /// Public base reported back in batch results for uploaded pins.
    pub public_url: Option<String>,
    pub output_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            fonts_dir: None,
            storage_url: None,
            public_url: None,
            output_dir: PathBuf::from("pins"),
        }
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub http: reqwest::Client,
    pub renderer: TemplateRenderer,
    pub uploader: Arc<dyn StorageUploader>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> PinforgeResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("pinforge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PinforgeError::Other(anyhow::anyhow!("http client error: {e}")))?;

        let mut text = TextEngine::new();
        if let Some(dir) = &config.fonts_dir {
            let loaded = text.load_fonts_dir(dir);
            tracing::info!(dir = %dir.display(), loaded, "fonts registered");
        }

        let renderer = TemplateRenderer::new(
            Arc::new(Mutex::new(text)),
            Arc::new(DirectImageSource::with_client(http.clone())),
        );

        let uploader: Arc<dyn StorageUploader> = match (&config.storage_url, &config.public_url) {
            (Some(storage), Some(public)) => Arc::new(HttpPutUploader::new(storage, public)?),
            (Some(storage), None) => Arc::new(HttpPutUploader::new(storage, storage)?),
            (None, _) => Arc::new(DirUploader::new(&config.output_dir)?),
        };

        Ok(Self {
            config,
            http,
            renderer,
            uploader,
        })
    }
}
