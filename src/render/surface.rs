use std::sync::Arc;

use anyhow::Context;

use crate::{
    assets::decode::PreparedImage,
    foundation::{
        color::{Rgba8, parse_hex_color},
        error::{PinforgeError, PinforgeResult},
    },
    render::text::TextBrushRgba8,
    template::model::RenderConfig,
};

/// Raster export format for a finished pin.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Jpeg,
    Png,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// JPEG quality in [1, 100]; ignored for PNG.
    pub quality: u8,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            format: ExportFormat::Jpeg,
            quality: 90,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TextStrokeOp {
    pub color: Rgba8,
    pub width: f64,
}

#[derive(Clone, Debug)]
pub struct TextShadowOp {
    pub color: Rgba8,
    pub dx: f64,
    pub dy: f64,
}

/// One buffered drawable. A row's render appends ops; [`Surface::repaint`]
/// replays them into pixels.
#[derive(Clone)]
pub enum DrawOp {
    FillPath {
        path: kurbo::BezPath,
        transform: kurbo::Affine,
        color: Rgba8,
        opacity: f32,
    },
    StrokePath {
        path: kurbo::BezPath,
        transform: kurbo::Affine,
        color: Rgba8,
        width: f64,
        opacity: f32,
    },
    Image {
        paint: vello_cpu::Image,
        transform: kurbo::Affine,
        /// Mask path in the image's pixel space (corner-radius clip baked in).
        mask: kurbo::BezPath,
        opacity: f32,
    },
    Text {
        layout: Arc<parley::Layout<TextBrushRgba8>>,
        font: vello_cpu::peniko::FontData,
        transform: kurbo::Affine,
        stroke: Option<TextStrokeOp>,
        shadow: Option<TextShadowOp>,
        /// Box-background decoration fill, drawn before the glyphs.
        background: Option<(Rgba8, kurbo::Rect)>,
        opacity: f32,
    },
}

/// An in-memory drawing target: a display list plus a reusable pixmap.
///
/// Construction is the expensive part (the pixel allocation); resetting and
/// repainting reuse it, which is what makes pooling surfaces worthwhile.
pub struct Surface {
    width: u16,
    height: u16,
    background: Rgba8,
    ops: Vec<DrawOp>,
    pixmap: vello_cpu::Pixmap,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> PinforgeResult<Self> {
        let (w, h) = checked_dims(width, height)?;
        Ok(Self {
            width: w,
            height: h,
            background: Rgba8::TRANSPARENT,
            ops: Vec::new(),
            pixmap: vello_cpu::Pixmap::new(w, h),
        })
    }

    pub fn width(&self) -> u32 {
        u32::from(self.width)
    }

    pub fn height(&self) -> u32 {
        u32::from(self.height)
    }

    /// Prepare the surface for a new render: apply dimensions and background
    /// from `config` and drop any prior content. Within one batch all rows
    /// share one size, so the pixmap reallocation branch only runs for
    /// interactive resizes.
    pub fn reset(&mut self, config: &RenderConfig) -> PinforgeResult<()> {
        let (w, h) = checked_dims(config.width, config.height)?;
        if w != self.width || h != self.height {
            self.width = w;
            self.height = h;
            self.pixmap = vello_cpu::Pixmap::new(w, h);
        }
        self.background = parse_hex_color(&config.background_color)?;
        self.ops.clear();
        Ok(())
    }

    /// Clear all drawable contents; used when a pooled surface is returned
    /// so a row's leftovers never bleed into the next row.
    pub fn clear(&mut self) {
        self.ops.clear();
        clear_pixmap(&mut self.pixmap, [0, 0, 0, 0]);
    }

    pub fn push(&mut self, op: DrawOp) {
        self.ops.push(op);
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    /// Replay the display list into the pixmap through a fresh render
    /// context and flush it. Must run before [`Surface::export`]; drawables
    /// are buffered until this synchronous repaint.
    pub fn repaint(&mut self) -> PinforgeResult<()> {
        let mut ctx = vello_cpu::RenderContext::new(self.width, self.height);
        for op in &self.ops {
            render_op(&mut ctx, op);
        }
        ctx.flush();
        clear_pixmap(&mut self.pixmap, self.background.premultiplied());
        ctx.render_to_pixmap(&mut self.pixmap);
        Ok(())
    }

    /// Premultiplied RGBA8 pixels of the last repaint.
    pub fn pixels(&self) -> &[u8] {
        self.pixmap.data_as_u8_slice()
    }

    /// Encode the last repaint to an image byte buffer.
    pub fn export(&self, opts: &ExportOptions) -> PinforgeResult<Vec<u8>> {
        use image::ImageEncoder;

        let straight = unpremultiply(self.pixmap.data_as_u8_slice());
        let mut out = Vec::new();
        match opts.format {
            ExportFormat::Png => {
                image::codecs::png::PngEncoder::new(&mut out)
                    .write_image(
                        &straight,
                        self.width(),
                        self.height(),
                        image::ExtendedColorType::Rgba8,
                    )
                    .context("encode png")?;
            }
            ExportFormat::Jpeg => {
                // JPEG carries no alpha: flatten over the surface background
                // (white when the background itself is transparent).
                let base = if self.background.a == 0 {
                    Rgba8::WHITE
                } else {
                    self.background
                };
                let rgb = flatten_over(&straight, base);
                let quality = opts.quality.clamp(1, 100);
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
                    .write_image(
                        &rgb,
                        self.width(),
                        self.height(),
                        image::ExtendedColorType::Rgb8,
                    )
                    .context("encode jpeg")?;
            }
        }
        Ok(out)
    }
}

fn checked_dims(width: u32, height: u32) -> PinforgeResult<(u16, u16)> {
    if width == 0 || height == 0 {
        return Err(PinforgeError::validation("surface size must be > 0"));
    }
    let w: u16 = width
        .try_into()
        .map_err(|_| PinforgeError::validation("surface width exceeds u16"))?;
    let h: u16 = height
        .try_into()
        .map_err(|_| PinforgeError::validation("surface height exceeds u16"))?;
    Ok((w, h))
}

fn clear_pixmap(pixmap: &mut vello_cpu::Pixmap, rgba: [u8; 4]) {
    let data = pixmap.data_as_u8_slice_mut();
    for px in data.chunks_exact_mut(4) {
        px.copy_from_slice(&rgba);
    }
}

fn unpremultiply(premul: &[u8]) -> Vec<u8> {
    let mut out = premul.to_vec();
    for px in out.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 0 || a == 255 {
            continue;
        }
        px[0] = ((px[0] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[1] = ((px[1] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[2] = ((px[2] as u16 * 255 + a / 2) / a).min(255) as u8;
    }
    out
}

fn flatten_over(straight_rgba: &[u8], base: Rgba8) -> Vec<u8> {
    let mut out = Vec::with_capacity(straight_rgba.len() / 4 * 3);
    for px in straight_rgba.chunks_exact(4) {
        let a = px[3] as u32;
        let inv = 255 - a;
        out.push(((px[0] as u32 * a + base.r as u32 * inv) / 255) as u8);
        out.push(((px[1] as u32 * a + base.g as u32 * inv) / 255) as u8);
        out.push(((px[2] as u32 * a + base.b as u32 * inv) / 255) as u8);
    }
    out
}

/// Convert a prepared image into a vello paint, sharing the pixel buffer.
pub fn image_paint(img: &PreparedImage) -> PinforgeResult<vello_cpu::Image> {
    let pixmap = premul_bytes_to_pixmap(img.rgba8_premul.as_slice(), img.width, img.height)?;
    Ok(vello_cpu::Image {
        image: vello_cpu::ImageSource::Pixmap(Arc::new(pixmap)),
        sampler: vello_cpu::peniko::ImageSampler::default(),
    })
}

fn premul_bytes_to_pixmap(
    rgba8_premul: &[u8],
    width: u32,
    height: u32,
) -> PinforgeResult<vello_cpu::Pixmap> {
    let w: u16 = width
        .try_into()
        .map_err(|_| PinforgeError::image("image width exceeds u16"))?;
    let h: u16 = height
        .try_into()
        .map_err(|_| PinforgeError::image("image height exceeds u16"))?;
    if rgba8_premul.len() != width as usize * height as usize * 4 {
        return Err(PinforgeError::image("prepared image byte length mismatch"));
    }

    let mut may_have_opacities = false;
    let mut pixels = Vec::with_capacity(width as usize * height as usize);
    for px in rgba8_premul.chunks_exact(4) {
        let a = px[3];
        may_have_opacities |= a != 255;
        pixels.push(vello_cpu::peniko::color::PremulRgba8 {
            r: px[0],
            g: px[1],
            b: px[2],
            a,
        });
    }

    Ok(vello_cpu::Pixmap::from_parts_with_opacity(
        pixels,
        w,
        h,
        may_have_opacities,
    ))
}

fn render_op(ctx: &mut vello_cpu::RenderContext, op: &DrawOp) {
    ctx.set_paint_transform(vello_cpu::kurbo::Affine::IDENTITY);

    match op {
        DrawOp::FillPath {
            path,
            transform,
            color,
            opacity,
        } => {
            ctx.set_transform(affine_to_cpu(*transform));
            ctx.set_paint(color_to_cpu(*color));
            if *opacity < 1.0 {
                ctx.push_opacity_layer(*opacity);
            }
            let cpu_path = bezpath_to_cpu(path);
            ctx.fill_path(&cpu_path);
            if *opacity < 1.0 {
                ctx.pop_layer();
            }
        }
        DrawOp::StrokePath {
            path,
            transform,
            color,
            width,
            opacity,
        } => {
            ctx.set_transform(affine_to_cpu(*transform));
            ctx.set_stroke(vello_cpu::kurbo::Stroke::new(*width));
            ctx.set_paint(color_to_cpu(*color));
            if *opacity < 1.0 {
                ctx.push_opacity_layer(*opacity);
            }
            let cpu_path = bezpath_to_cpu(path);
            ctx.stroke_path(&cpu_path);
            if *opacity < 1.0 {
                ctx.pop_layer();
            }
        }
        DrawOp::Image {
            paint,
            transform,
            mask,
            opacity,
        } => {
            ctx.set_transform(affine_to_cpu(*transform));
            ctx.set_paint(paint.clone());
            if *opacity < 1.0 {
                ctx.push_opacity_layer(*opacity);
            }
            let cpu_mask = bezpath_to_cpu(mask);
            ctx.fill_path(&cpu_mask);
            if *opacity < 1.0 {
                ctx.pop_layer();
            }
        }
        DrawOp::Text {
            layout,
            font,
            transform,
            stroke,
            shadow,
            background,
            opacity,
        } => {
            if *opacity < 1.0 {
                ctx.push_opacity_layer(*opacity);
            }

            if let Some((color, rect)) = background {
                ctx.set_transform(affine_to_cpu(*transform));
                ctx.set_paint(color_to_cpu(*color));
                ctx.fill_rect(&vello_cpu::kurbo::Rect::new(
                    rect.x0, rect.y0, rect.x1, rect.y1,
                ));
            }

            if let Some(sh) = shadow {
                let shadow_transform =
                    *transform * kurbo::Affine::translate(kurbo::Vec2::new(sh.dx, sh.dy));
                ctx.set_transform(affine_to_cpu(shadow_transform));
                draw_glyph_runs(ctx, layout, font, Some(sh.color), GlyphPass::Fill);
            }

            ctx.set_transform(affine_to_cpu(*transform));
            if let Some(st) = stroke {
                ctx.set_stroke(vello_cpu::kurbo::Stroke::new(st.width));
                draw_glyph_runs(ctx, layout, font, Some(st.color), GlyphPass::Stroke);
            }
            draw_glyph_runs(ctx, layout, font, None, GlyphPass::Fill);

            if *opacity < 1.0 {
                ctx.pop_layer();
            }
        }
    }
}

#[derive(Clone, Copy)]
enum GlyphPass {
    Fill,
    Stroke,
}

fn draw_glyph_runs(
    ctx: &mut vello_cpu::RenderContext,
    layout: &parley::Layout<TextBrushRgba8>,
    font: &vello_cpu::peniko::FontData,
    override_color: Option<Rgba8>,
    pass: GlyphPass,
) {
    for line in layout.lines() {
        for item in line.items() {
            let parley::layout::PositionedLayoutItem::GlyphRun(run) = item else {
                continue;
            };

            let color = override_color.unwrap_or_else(|| {
                let brush = run.style().brush;
                Rgba8::new(brush.r, brush.g, brush.b, brush.a)
            });
            ctx.set_paint(color_to_cpu(color));

            let glyphs = run.glyphs().map(|g| vello_cpu::Glyph {
                id: g.id,
                x: g.x,
                y: g.y,
            });
            let builder = ctx.glyph_run(font).font_size(run.run().font_size());
            match pass {
                GlyphPass::Fill => builder.fill_glyphs(glyphs),
                GlyphPass::Stroke => builder.stroke_glyphs(glyphs),
            }
        }
    }
}

fn color_to_cpu(c: Rgba8) -> vello_cpu::peniko::Color {
    vello_cpu::peniko::Color::from_rgba8(c.r, c.g, c.b, c.a)
}

fn affine_to_cpu(a: kurbo::Affine) -> vello_cpu::kurbo::Affine {
    vello_cpu::kurbo::Affine::new(a.as_coeffs())
}

fn point_to_cpu(p: kurbo::Point) -> vello_cpu::kurbo::Point {
    vello_cpu::kurbo::Point::new(p.x, p.y)
}

fn bezpath_to_cpu(path: &kurbo::BezPath) -> vello_cpu::kurbo::BezPath {
    use kurbo::PathEl;

    let mut out = vello_cpu::kurbo::BezPath::new();
    for &el in path.elements() {
        match el {
            PathEl::MoveTo(p) => out.move_to(point_to_cpu(p)),
            PathEl::LineTo(p) => out.line_to(point_to_cpu(p)),
            PathEl::QuadTo(p1, p2) => out.quad_to(point_to_cpu(p1), point_to_cpu(p2)),
            PathEl::CurveTo(p1, p2, p3) => {
                out.curve_to(point_to_cpu(p1), point_to_cpu(p2), point_to_cpu(p3));
            }
            PathEl::ClosePath => out.close_path(),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kurbo::Shape;

    fn config(width: u32, height: u32, bg: &str) -> RenderConfig {
        RenderConfig {
            width,
            height,
            background_color: bg.to_string(),
            interactive: false,
        }
    }

    fn fill_rect_op(x: f64, y: f64, w: f64, h: f64, color: Rgba8) -> DrawOp {
        DrawOp::FillPath {
            path: kurbo::Rect::new(x, y, x + w, y + h).to_path(0.1),
            transform: kurbo::Affine::IDENTITY,
            color,
            opacity: 1.0,
        }
    }

    #[test]
    fn rejects_degenerate_dimensions() {
        assert!(Surface::new(0, 10).is_err());
        assert!(Surface::new(100_000, 10).is_err());
    }

    #[test]
    fn reset_drops_prior_ops_and_applies_background() {
        let mut s = Surface::new(8, 8).unwrap();
        s.push(fill_rect_op(0.0, 0.0, 4.0, 4.0, Rgba8::new(255, 0, 0, 255)));
        assert_eq!(s.op_count(), 1);

        s.reset(&config(8, 8, "#00ff00")).unwrap();
        assert_eq!(s.op_count(), 0);
        s.repaint().unwrap();
        assert_eq!(&s.pixels()[..4], &[0, 255, 0, 255]);
    }

    #[test]
    fn repaint_replaces_previous_contents() {
        let mut s = Surface::new(8, 8).unwrap();
        s.reset(&config(8, 8, "#000000")).unwrap();
        s.push(fill_rect_op(0.0, 0.0, 8.0, 8.0, Rgba8::new(255, 0, 0, 255)));
        s.repaint().unwrap();
        let red = s.pixels().to_vec();

        // Same surface, different row contents: no leakage from the red fill.
        s.reset(&config(8, 8, "#000000")).unwrap();
        s.push(fill_rect_op(0.0, 0.0, 8.0, 8.0, Rgba8::new(0, 0, 255, 255)));
        s.repaint().unwrap();
        let blue = s.pixels().to_vec();

        assert_ne!(red, blue);
        assert_eq!(&blue[..4], &[0, 0, 255, 255]);
    }

    #[test]
    fn reuse_is_deterministic() {
        let draw = |s: &mut Surface| {
            s.reset(&config(16, 16, "#102030")).unwrap();
            s.push(fill_rect_op(2.0, 2.0, 9.0, 5.0, Rgba8::new(200, 10, 10, 255)));
            s.repaint().unwrap();
            s.pixels().to_vec()
        };

        let mut reused = Surface::new(16, 16).unwrap();
        let a = draw(&mut reused);
        reused.clear();
        let b = draw(&mut reused);
        let mut fresh = Surface::new(16, 16).unwrap();
        let c = draw(&mut fresh);

        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn export_png_roundtrips() {
        let mut s = Surface::new(8, 8).unwrap();
        s.reset(&config(8, 8, "#ff0000")).unwrap();
        s.repaint().unwrap();

        let bytes = s
            .export(&ExportOptions {
                format: ExportFormat::Png,
                quality: 90,
            })
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (8, 8));
        assert_eq!(decoded.get_pixel(0, 0).0, [255, 0, 0, 255]);
    }

    #[test]
    fn export_jpeg_flattens_transparent_background_over_white() {
        let mut s = Surface::new(8, 8).unwrap();
        s.reset(&config(8, 8, "transparent")).unwrap();
        s.repaint().unwrap();

        let bytes = s.export(&ExportOptions::default()).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        let px = decoded.get_pixel(4, 4).0;
        // JPEG is lossy; the flattened background must be near-white.
        assert!(px.iter().all(|&c| c > 245), "expected white-ish, got {px:?}");
    }
}
