use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

use crate::{
    batch::scheduler::{BatchRequest, BatchResponse, run_batch},
    foundation::error::PinforgeError,
    render::{
        pool::PoolConfig,
        surface::{ExportFormat, ExportOptions, Surface},
    },
    server::state::AppState,
    template::{
        fields::{FieldMapping, RowData},
        model::{CanvasSize, Element, RenderConfig, default_background},
    },
};

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

fn error_response(status: StatusCode, error: &PinforgeError) -> Response {
    (
        status,
        Json(serde_json::json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

fn status_for(error: &PinforgeError) -> StatusCode {
    match error {
        PinforgeError::Validation(_) | PinforgeError::Serde(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// POST /api/pins/generate: run one batch page and report the envelope.
///
/// A batch that failed to start yields a top-level `success: false`; a batch
/// that ran reports per-row failures inside `results` and `stats.failed`.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchRequest>,
) -> Response {
    let pool_cfg = PoolConfig::from_env(request.canvas_size.width, request.canvas_size.height);
    match run_batch(&request, &state.renderer, state.uploader.clone(), pool_cfg).await {
        Ok(outcome) => (StatusCode::OK, Json(BatchResponse::from(outcome))).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "batch failed to start");
            error_response(status_for(&e), &e)
        }
    }
}

/// Single-row render request for editor previews.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub elements: Vec<Element>,
    pub canvas_size: CanvasSize,
    #[serde(default = "default_background")]
    pub background_color: String,
    #[serde(default)]
    pub field_mapping: FieldMapping,
    #[serde(default)]
    pub row: RowData,
}

/// POST /api/pins/preview: render one row and respond with PNG bytes.
pub async fn preview(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreviewRequest>,
) -> Response {
    let config = RenderConfig {
        width: request.canvas_size.width,
        height: request.canvas_size.height,
        background_color: request.background_color.clone(),
        interactive: true,
    };

    let render = async {
        let mut surface = Surface::new(config.width, config.height)?;
        state
            .renderer
            .render(
                &mut surface,
                &request.elements,
                &config,
                &request.row,
                &request.field_mapping,
            )
            .await?;
        surface.export(&ExportOptions {
            format: ExportFormat::Png,
            quality: 90,
        })
    };

    match render.await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(e) => error_response(status_for(&e), &e),
    }
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct ProxyQuery {
    pub url: String,
}

/// GET /api/proxy-image?url=...: the same-origin image proxy.
///
/// Browser-context renders route external images through this endpoint so
/// raster export is not blocked by canvas tainting; the server fetches the
/// bytes and passes them through with their content type.
pub async fn proxy_image(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProxyQuery>,
) -> Response {
    let parsed = match url::Url::parse(&query.url) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => u,
        Ok(u) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("unsupported proxy scheme '{}'", u.scheme()),
            )
                .into_response();
        }
        Err(e) => {
            return (StatusCode::BAD_REQUEST, format!("invalid url: {e}")).into_response();
        }
    };

    let response = match state.http.get(parsed.clone()).send().await {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                format!("failed to fetch {parsed}: {e}"),
            )
                .into_response();
        }
    };
    if !response.status().is_success() {
        return (
            StatusCode::BAD_GATEWAY,
            format!("upstream returned HTTP {}", response.status()),
        )
            .into_response();
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();

    match response.bytes().await {
        Ok(bytes) => ([(header::CONTENT_TYPE, content_type)], bytes.to_vec()).into_response(),
        Err(e) => (StatusCode::BAD_GATEWAY, format!("failed to read body: {e}")).into_response(),
    }
}
