//! Chunked, bounded-concurrency batch scheduler.
//!
//! Drives N rows through a surface pool of size K: rows are partitioned into
//! consecutive chunks of K, each chunk's renders run concurrently and the
//! chunk fully drains before the next one starts. Peak concurrency therefore
//! equals the pool size and memory stays bounded at `K * per-surface cost`
//! no matter how many rows arrive.

use std::{sync::Arc, time::Instant};

use futures::future::join_all;

use crate::{
    foundation::error::{PinforgeError, PinforgeResult},
    render::{
        pool::{PoolConfig, SurfacePool},
        renderer::TemplateRenderer,
        surface::{ExportFormat, ExportOptions},
    },
    template::{
        fields::{FieldMapping, RowData},
        model::{CanvasSize, Element, RenderConfig, default_background, validate_canvas,
                validate_elements},
    },
    upload::storage::StorageUploader,
};

/// One batch invocation: a contiguous page of rows for one template.
///
/// `start_index` offsets the reported indices so a campaign can be submitted
/// as successive pages and failed rows can be resubmitted precisely.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub elements: Vec<Element>,
    pub canvas_size: CanvasSize,
    #[serde(default = "default_background")]
    pub background_color: String,
    #[serde(default)]
    pub field_mapping: FieldMapping,
    pub csv_rows: Vec<RowData>,
    #[serde(default)]
    pub start_index: usize,
    #[serde(default)]
    pub format: ExportFormat,
    #[serde(default = "default_quality")]
    pub quality: u8,
}

fn default_quality() -> u8 {
    90
}

/// Per-row outcome. `index` always equals `start_index + position`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinResult {
    pub index: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub pins_per_second: f64,
}

#[derive(Clone, Debug)]
pub struct BatchOutcome {
    pub results: Vec<PinResult>,
    pub stats: BatchStats,
}

/// The JSON envelope a batch that actually ran serializes to.
///
/// A batch that failed to start is reported separately as
/// `{"success": false, "error": …}` by the HTTP layer.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub success: bool,
    pub results: Vec<PinResult>,
    pub stats: BatchStats,
}

impl From<BatchOutcome> for BatchResponse {
    fn from(outcome: BatchOutcome) -> Self {
        Self {
            success: true,
            results: outcome.results,
            stats: outcome.stats,
        }
    }
}

/// Run a batch with a pool sized by `pool_cfg`.
///
/// Pool construction or template validation failure is fatal for the whole
/// request; per-row render/upload failures are recorded in that row's
/// result and never abort sibling rows.
pub async fn run_batch(
    request: &BatchRequest,
    renderer: &TemplateRenderer,
    uploader: Arc<dyn StorageUploader>,
    pool_cfg: PoolConfig,
) -> PinforgeResult<BatchOutcome> {
    validate_canvas(&request.canvas_size)?;
    validate_elements(&request.elements)?;
    crate::foundation::color::parse_hex_color(&request.background_color)?;

    let pool = Arc::new(SurfacePool::new(
        pool_cfg.size,
        request.canvas_size.width,
        request.canvas_size.height,
    )?);
    run_batch_with_pool(request, renderer, uploader, pool).await
}

/// Run a batch against an externally constructed pool.
///
/// The pool's `cleanup()` runs exactly once after the chunk loop, on both
/// the success and the failure path.
#[tracing::instrument(
    skip_all,
    fields(rows = request.csv_rows.len(), start = request.start_index, pool = pool.size())
)]
pub async fn run_batch_with_pool(
    request: &BatchRequest,
    renderer: &TemplateRenderer,
    uploader: Arc<dyn StorageUploader>,
    pool: Arc<SurfacePool>,
) -> PinforgeResult<BatchOutcome> {
    let config = RenderConfig::batch(request.canvas_size, request.background_color.clone());
    let export = ExportOptions {
        format: request.format,
        quality: request.quality,
    };

    let total = request.csv_rows.len();
    let started = Instant::now();
    let mut slots: Vec<Option<PinResult>> = Vec::new();
    slots.resize_with(total, || None);

    let run = async {
        for (chunk_no, chunk) in request.csv_rows.chunks(pool.size()).enumerate() {
            let chunk_base = chunk_no * pool.size();
            let futures = chunk.iter().enumerate().map(|(offset, row)| {
                let index = request.start_index + chunk_base + offset;
                render_one(
                    &pool,
                    renderer,
                    uploader.as_ref(),
                    &request.elements,
                    &config,
                    &request.field_mapping,
                    row,
                    index,
                    export,
                )
            });

            // Results land keyed by computed offset, not completion order.
            for (offset, result) in join_all(futures).await.into_iter().enumerate() {
                slots[chunk_base + offset] = Some(result);
            }
            tracing::debug!(chunk = chunk_no, drained = chunk_base + chunk.len(), "chunk drained");
        }
        Ok::<(), PinforgeError>(())
    }
    .await;

    pool.cleanup();
    run?;

    let results: Vec<PinResult> = slots
        .into_iter()
        .map(|slot| slot.ok_or_else(|| PinforgeError::render("row result slot left unfilled")))
        .collect::<PinforgeResult<_>>()?;

    let duration = started.elapsed();
    let success = results.iter().filter(|r| r.success).count();
    let stats = BatchStats {
        total,
        success,
        failed: total - success,
        duration_ms: duration.as_millis() as u64,
        pins_per_second: if duration.as_secs_f64() > 0.0 {
            success as f64 / duration.as_secs_f64()
        } else {
            0.0
        },
    };
    tracing::info!(
        total = stats.total,
        success = stats.success,
        failed = stats.failed,
        duration_ms = stats.duration_ms,
        "batch finished"
    );

    Ok(BatchOutcome { results, stats })
}

#[allow(clippy::too_many_arguments)]
async fn render_one(
    pool: &Arc<SurfacePool>,
    renderer: &TemplateRenderer,
    uploader: &dyn StorageUploader,
    elements: &[Element],
    config: &RenderConfig,
    mapping: &FieldMapping,
    row: &RowData,
    index: usize,
    export: ExportOptions,
) -> PinResult {
    match render_and_upload(pool, renderer, uploader, elements, config, mapping, row, index, export)
        .await
    {
        Ok((url, file_name)) => PinResult {
            index,
            success: true,
            url: Some(url),
            file_name: Some(file_name),
            error: None,
        },
        Err(e) => {
            tracing::warn!(index, error = %e, "pin render failed");
            PinResult {
                index,
                success: false,
                url: None,
                file_name: None,
                error: Some(e.to_string()),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn render_and_upload(
    pool: &Arc<SurfacePool>,
    renderer: &TemplateRenderer,
    uploader: &dyn StorageUploader,
    elements: &[Element],
    config: &RenderConfig,
    mapping: &FieldMapping,
    row: &RowData,
    index: usize,
    export: ExportOptions,
) -> PinforgeResult<(String, String)> {
    // The guard scope bounds surface ownership: render + export happen with
    // the surface held, upload happens after it is back in the pool.
    let bytes = {
        let mut surface = pool.acquire().await?;
        renderer
            .render(&mut surface, elements, config, row, mapping)
            .await?;
        surface.export(&export)?
    };

    let file_name = format!(
        "pin-{index}-{}.{}",
        uuid::Uuid::new_v4(),
        export.format.extension()
    );
    let url = uploader.upload(&bytes, &file_name).await?;
    Ok((url, file_name))
}
