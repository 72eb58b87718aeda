use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use pinforge::{
    BatchRequest, CanvasSize, ExportFormat, FieldMapping, ImageSource, MemoryUploader,
    PinforgeError, PinforgeResult, PoolConfig, PreparedImage, RowData, StorageUploader,
    SurfacePool, TemplateRenderer, TextEngine, run_batch, run_batch_with_pool,
};
use pretty_assertions::assert_eq;

struct InMemoryImages {
    images: HashMap<String, PreparedImage>,
}

impl InMemoryImages {
    fn new() -> Self {
        Self {
            images: HashMap::new(),
        }
    }

    fn insert_solid(&mut self, src: &str, rgba: [u8; 4]) {
        let mut data = Vec::new();
        for _ in 0..4 {
            data.extend_from_slice(&rgba);
        }
        self.images.insert(
            src.to_string(),
            PreparedImage {
                width: 2,
                height: 2,
                rgba8_premul: Arc::new(data),
            },
        );
    }
}

#[async_trait]
impl ImageSource for InMemoryImages {
    async fn load(&self, src: &str) -> PinforgeResult<PreparedImage> {
        self.images
            .get(src)
            .cloned()
            .ok_or_else(|| PinforgeError::image(format!("failed to load '{src}'")))
    }
}

struct FailingImages;

#[async_trait]
impl ImageSource for FailingImages {
    async fn load(&self, src: &str) -> PinforgeResult<PreparedImage> {
        Err(PinforgeError::image(format!("failed to load '{src}'")))
    }
}

/// Uploader instrumented to observe how many rows are in flight at once.
struct ProbeUploader {
    inner: MemoryUploader,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ProbeUploader {
    fn new() -> Self {
        Self {
            inner: MemoryUploader::new(),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StorageUploader for ProbeUploader {
    async fn upload(&self, bytes: &[u8], key: &str) -> PinforgeResult<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let result = self.inner.upload(bytes, key).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn renderer_with(images: impl ImageSource + 'static) -> TemplateRenderer {
    TemplateRenderer::new(Arc::new(Mutex::new(TextEngine::new())), Arc::new(images))
}

fn image_element(field: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "img", "name": "Photo", "type": "image",
        "x": 0.0, "y": 0.0, "width": 8.0, "height": 8.0,
        "src": "", "isDynamic": true, "field": field, "fit": "fill",
    })
}

fn badge_element() -> serde_json::Value {
    serde_json::json!({
        "id": "badge", "name": "Badge", "type": "shape", "shape": "rect",
        "x": 0.0, "y": 0.0, "width": 3.0, "height": 3.0,
        "zIndex": 2, "fill": "#00ff00",
    })
}

fn photo_row(url: &str) -> RowData {
    [("Photo".to_string(), url.to_string())]
        .into_iter()
        .collect()
}

fn photo_mapping() -> FieldMapping {
    [("image".to_string(), "Photo".to_string())]
        .into_iter()
        .collect()
}

fn request(rows: Vec<RowData>, start_index: usize) -> BatchRequest {
    BatchRequest {
        elements: vec![
            serde_json::from_value(image_element("image")).unwrap(),
            serde_json::from_value(badge_element()).unwrap(),
        ],
        canvas_size: CanvasSize {
            width: 8,
            height: 8,
        },
        background_color: "#ffffff".to_string(),
        field_mapping: photo_mapping(),
        csv_rows: rows,
        start_index,
        format: ExportFormat::Jpeg,
        quality: 90,
    }
}

fn good_images() -> InMemoryImages {
    let mut images = InMemoryImages::new();
    images.insert_solid("https://x/a.jpg", [255, 0, 0, 255]);
    images.insert_solid("https://x/b.jpg", [0, 0, 255, 255]);
    images.insert_solid("https://x/c.jpg", [0, 255, 0, 255]);
    images.insert_solid("https://x/d.jpg", [9, 9, 9, 255]);
    images.insert_solid("https://x/e.jpg", [7, 7, 7, 255]);
    images.insert_solid("https://x/f.jpg", [5, 5, 5, 255]);
    images
}

#[tokio::test]
async fn partial_failure_keeps_siblings_and_counts() {
    // 3 rows, one with an unloadable image: the batch runs, rows 0 and 1
    // succeed with URLs, row 2 carries the image error.
    let rows = vec![
        photo_row("https://x/a.jpg"),
        photo_row("https://x/b.jpg"),
        photo_row("https://x/missing.jpg"),
    ];
    let renderer = renderer_with(good_images());
    let uploader = Arc::new(MemoryUploader::new());

    let outcome = run_batch(
        &request(rows, 0),
        &renderer,
        uploader.clone(),
        PoolConfig::fixed(2),
    )
    .await
    .unwrap();

    assert_eq!(outcome.stats.total, 3);
    assert_eq!(outcome.stats.success, 2);
    assert_eq!(outcome.stats.failed, 1);
    assert!(outcome.results[0].success);
    assert!(outcome.results[1].success);
    assert!(!outcome.results[2].success);
    assert!(
        outcome.results[2]
            .error
            .as_deref()
            .unwrap()
            .contains("missing.jpg")
    );
    assert!(outcome.results[0].url.as_deref().unwrap().starts_with("memory://"));
    assert_eq!(uploader.count(), 2);
}

#[tokio::test]
async fn results_are_index_stable_regardless_of_failures() {
    let rows = vec![
        photo_row("https://x/a.jpg"),
        photo_row("bad-1"),
        photo_row("https://x/b.jpg"),
        photo_row("bad-2"),
        photo_row("https://x/c.jpg"),
    ];
    let n = rows.len();
    let start_index = 40;
    let renderer = renderer_with(good_images());

    let outcome = run_batch(
        &request(rows, start_index),
        &renderer,
        Arc::new(MemoryUploader::new()),
        PoolConfig::fixed(2),
    )
    .await
    .unwrap();

    assert_eq!(outcome.results.len(), n);
    for (i, result) in outcome.results.iter().enumerate() {
        assert_eq!(result.index, start_index + i);
    }
    assert_eq!(
        outcome.stats.success + outcome.stats.failed,
        outcome.stats.total
    );
}

#[tokio::test]
async fn empty_batch_yields_empty_results() {
    let renderer = renderer_with(InMemoryImages::new());
    let outcome = run_batch(
        &request(vec![], 0),
        &renderer,
        Arc::new(MemoryUploader::new()),
        PoolConfig::fixed(2),
    )
    .await
    .unwrap();
    assert!(outcome.results.is_empty());
    assert_eq!(outcome.stats.total, 0);
    assert_eq!(outcome.stats.success, 0);
    assert_eq!(outcome.stats.failed, 0);
}

#[tokio::test]
async fn cleanup_runs_exactly_once_when_every_row_fails() {
    let rows = vec![
        photo_row("https://x/a.jpg"),
        photo_row("https://x/b.jpg"),
        photo_row("https://x/c.jpg"),
    ];
    let renderer = renderer_with(FailingImages);
    let pool = Arc::new(SurfacePool::new(2, 8, 8).unwrap());

    let outcome = run_batch_with_pool(
        &request(rows, 0),
        &renderer,
        Arc::new(MemoryUploader::new()),
        pool.clone(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.stats.failed, 3);
    assert_eq!(outcome.stats.success, 0);
    assert_eq!(pool.cleanup_calls(), 1);
    assert!(pool.acquire().await.is_err());
}

#[tokio::test]
async fn concurrency_stays_within_pool_size() {
    let rows: Vec<RowData> = [
        "https://x/a.jpg",
        "https://x/b.jpg",
        "https://x/c.jpg",
        "https://x/d.jpg",
        "https://x/e.jpg",
        "https://x/f.jpg",
    ]
    .iter()
    .map(|u| photo_row(u))
    .collect();

    let renderer = renderer_with(good_images());
    let pool = Arc::new(SurfacePool::new(2, 8, 8).unwrap());
    let uploader = Arc::new(ProbeUploader::new());

    let outcome = run_batch_with_pool(&request(rows, 0), &renderer, uploader.clone(), pool.clone())
        .await
        .unwrap();

    assert_eq!(outcome.stats.success, 6);
    assert!(pool.high_water() <= 2, "pool high water {}", pool.high_water());
    assert!(
        uploader.max_in_flight.load(Ordering::SeqCst) <= 2,
        "chunk barrier should cap concurrent rows"
    );
}

#[tokio::test]
async fn png_format_flows_through_to_file_names() {
    let rows = vec![photo_row("https://x/a.jpg")];
    let mut req = request(rows, 0);
    req.format = ExportFormat::Png;
    let renderer = renderer_with(good_images());
    let uploader = Arc::new(MemoryUploader::new());

    let outcome = run_batch(&req, &renderer, uploader.clone(), PoolConfig::fixed(1))
        .await
        .unwrap();

    assert!(outcome.results[0].success);
    let keys = uploader.keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].starts_with("pin-0-"));
    assert!(keys[0].ends_with(".png"));
    assert_eq!(outcome.results[0].file_name.as_deref(), Some(keys[0].as_str()));
}

#[tokio::test]
async fn invalid_template_fails_the_whole_batch() {
    let mut req = request(vec![photo_row("https://x/a.jpg")], 0);
    req.canvas_size = CanvasSize {
        width: 0,
        height: 8,
    };
    let renderer = renderer_with(good_images());

    let err = run_batch(
        &req,
        &renderer,
        Arc::new(MemoryUploader::new()),
        PoolConfig::fixed(1),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("validation error"));
}
