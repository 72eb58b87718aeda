//! Pinforge renders personalized images ("pins") by merging a graphic
//! template with rows of tabular data.
//!
//! A template is a z-ordered list of positioned text/image/shape elements
//! with optional dynamic-field bindings. Each CSV row supplies values for
//! those bindings; each render composites one fully resolved row into a
//! raster image.
//!
//! # Pipeline overview
//!
//! 1. **Resolve**: `Element + RowData + FieldMapping -> concrete content`
//!    (dynamic bindings, `{{field}}` tokens, name fallback)
//! 2. **Composite**: build a display list on a [`Surface`] and repaint it
//!    through the CPU raster backend
//! 3. **Export**: encode the pixels to JPEG/PNG
//! 4. **Batch**: drive many rows through a bounded [`SurfacePool`] in
//!    chunks, upload successes, and report per-row results with aggregate
//!    stats
//!
//! Key design constraints:
//!
//! - **No unsafe**: `unsafe` is forbidden in this crate.
//! - **Deterministic per row**: a render fully replaces the surface's prior
//!   contents; reusing a pooled surface never leaks a previous row.
//! - **Bounded memory**: at most `pool size` surfaces exist per batch, and
//!   no more rows than that render concurrently.
//! - **Row-level failure isolation**: a failed image fetch or upload fails
//!   that row's result, never its siblings or the batch.
#![forbid(unsafe_code)]

mod assets;
mod batch;
mod foundation;
mod render;
mod server;
mod template;
mod upload;

pub use assets::decode::{PreparedImage, decode_data_uri, decode_image};
pub use assets::resolve::{DirectImageSource, ImageSource, ProxyImageSource};
pub use batch::scheduler::{
    BatchOutcome, BatchRequest, BatchResponse, BatchStats, PinResult, run_batch,
    run_batch_with_pool,
};
pub use foundation::color::{Rgba8, parse_hex_color};
pub use foundation::error::{PinforgeError, PinforgeResult};
pub use render::pool::{MEMORY_LIMIT_ENV, POOL_SIZE_ENV, PoolConfig, PooledSurface, SurfacePool};
pub use render::renderer::TemplateRenderer;
pub use render::surface::{
    DrawOp, ExportFormat, ExportOptions, Surface, TextShadowOp, TextStrokeOp, image_paint,
};
pub use render::text::{TextBrushRgba8, TextEngine, TextLayout, TextSpec};
pub use server::{AppState, ServerConfig, router, serve};
pub use template::fields::{
    FieldMapping, RowData, resolve_image_source, resolve_text_content, substitute_tokens,
};
pub use template::model::{
    CanvasSize, Element, ElementKind, FontStyle, ImageFit, ImageProps, RenderConfig, ShapeKind,
    ShapeProps, Template, TextAlign, TextProps, TextShadow, TextStroke,
};
pub use upload::storage::{DirUploader, HttpPutUploader, MemoryUploader, StorageUploader};
