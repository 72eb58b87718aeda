use std::sync::{Arc, Mutex};

use kurbo::Shape as _;

use crate::{
    assets::resolve::ImageSource,
    foundation::{
        color::{Rgba8, parse_hex_color},
        error::{PinforgeError, PinforgeResult},
    },
    render::{
        surface::{DrawOp, Surface, TextShadowOp, TextStrokeOp, image_paint},
        text::{TextBrushRgba8, TextEngine, TextSpec},
    },
    template::{
        fields::{FieldMapping, RowData, resolve_image_source, resolve_text_content},
        model::{Element, ElementKind, ImageFit, ImageProps, RenderConfig, ShapeKind, ShapeProps,
                TextProps},
    },
};

const PATH_TOLERANCE: f64 = 0.1;

/// Single-row compositing engine.
///
/// Stateless per call: one invocation resolves dynamic content for one row
/// and rebuilds the surface's display list from scratch. The text engine and
/// image source are shared services injected at construction.
pub struct TemplateRenderer {
    text: Arc<Mutex<TextEngine>>,
    images: Arc<dyn ImageSource>,
}

impl TemplateRenderer {
    pub fn new(text: Arc<Mutex<TextEngine>>, images: Arc<dyn ImageSource>) -> Self {
        Self { text, images }
    }

    /// Composite one row onto `surface`, leaving it repainted and ready to
    /// export. The caller's element order is never mutated; a sorted copy
    /// drives z-ordering (stable, so ties keep template order).
    #[tracing::instrument(skip_all, fields(elements = elements.len()))]
    pub async fn render(
        &self,
        surface: &mut Surface,
        elements: &[Element],
        config: &RenderConfig,
        row: &RowData,
        mapping: &FieldMapping,
    ) -> PinforgeResult<()> {
        surface.reset(config)?;

        let mut ordered: Vec<&Element> = elements.iter().collect();
        ordered.sort_by_key(|el| el.z_index);

        for el in ordered {
            if !el.visible {
                continue;
            }
            match &el.kind {
                ElementKind::Text(props) => self.push_text(surface, el, props, mapping, row)?,
                ElementKind::Image(props) => {
                    self.push_image(surface, el, props, mapping, row).await?;
                }
                ElementKind::Shape(props) => push_shape(surface, el, props)?,
            }
        }

        surface.repaint()
    }

    fn push_text(
        &self,
        surface: &mut Surface,
        el: &Element,
        props: &TextProps,
        mapping: &FieldMapping,
        row: &RowData,
    ) -> PinforgeResult<()> {
        let content = resolve_text_content(el, props, mapping, row);
        let transform = element_transform(el);
        let opacity = el.opacity as f32;

        let background = match &props.background {
            Some(bg) => {
                let color = parse_hex_color(bg)?;
                (color.a > 0).then(|| (color, kurbo::Rect::new(0.0, 0.0, el.width, el.height)))
            }
            None => None,
        };

        if content.trim().is_empty() {
            // Nothing to shape; the box background still renders.
            if let Some((color, rect)) = background {
                surface.push(DrawOp::FillPath {
                    path: rect.to_path(PATH_TOLERANCE),
                    transform,
                    color,
                    opacity,
                });
            }
            return Ok(());
        }

        let fill = parse_hex_color(&props.fill)?;
        let layout = {
            let mut engine = self
                .text
                .lock()
                .map_err(|_| PinforgeError::render("text engine lock poisoned"))?;
            engine.layout(&TextSpec {
                text: &content,
                family: &props.font_family,
                size: props.font_size,
                style: props.font_style,
                brush: TextBrushRgba8 {
                    r: fill.r,
                    g: fill.g,
                    b: fill.b,
                    a: fill.a,
                },
                line_height: props.line_height,
                letter_spacing: props.letter_spacing,
                max_width: el.width as f32,
                align: props.align,
            })?
        };

        let font = vello_cpu::peniko::FontData::new(
            vello_cpu::peniko::Blob::from(layout.font_bytes.as_ref().clone()),
            0,
        );

        let stroke = match &props.stroke {
            Some(s) if s.width > 0.0 => Some(TextStrokeOp {
                color: parse_hex_color(&s.color)?,
                width: s.width,
            }),
            _ => None,
        };
        let shadow = match &props.shadow {
            Some(s) => Some(TextShadowOp {
                color: parse_hex_color(&s.color)?,
                dx: s.offset_x,
                dy: s.offset_y,
            }),
            None => None,
        };

        surface.push(DrawOp::Text {
            layout: layout.layout,
            font,
            transform,
            stroke,
            shadow,
            background,
            opacity,
        });
        Ok(())
    }

    async fn push_image(
        &self,
        surface: &mut Surface,
        el: &Element,
        props: &ImageProps,
        mapping: &FieldMapping,
        row: &RowData,
    ) -> PinforgeResult<()> {
        if el.width <= 0.0 || el.height <= 0.0 {
            return Ok(());
        }

        let src = resolve_image_source(el, props, mapping, row);
        let prepared = self.images.load(&src).await?;
        let paint = image_paint(&prepared)?;

        let (iw, ih) = (f64::from(prepared.width), f64::from(prepared.height));
        let (sx, sy, dx, dy) = match props.fit {
            ImageFit::Fill => (el.width / iw, el.height / ih, 0.0, 0.0),
            ImageFit::Cover => {
                let s = (el.width / iw).max(el.height / ih);
                (s, s, (el.width - iw * s) / 2.0, (el.height - ih * s) / 2.0)
            }
            ImageFit::Contain => {
                let s = (el.width / iw).min(el.height / ih);
                (s, s, (el.width - iw * s) / 2.0, (el.height - ih * s) / 2.0)
            }
        };
        let fit_affine = kurbo::Affine::translate(kurbo::Vec2::new(dx, dy))
            * kurbo::Affine::scale_non_uniform(sx, sy);

        // The op draws in image pixel space; the corner-radius mask is built
        // in element space and carried back through the fit transform so the
        // clip lands on the element box.
        let radius = props.corner_radius.max(0.0);
        let mut mask = if radius > 0.0 {
            kurbo::RoundedRect::new(0.0, 0.0, el.width, el.height, radius).to_path(PATH_TOLERANCE)
        } else {
            kurbo::Rect::new(0.0, 0.0, el.width, el.height).to_path(PATH_TOLERANCE)
        };
        mask.apply_affine(fit_affine.inverse());

        surface.push(DrawOp::Image {
            paint,
            transform: element_transform(el) * fit_affine,
            mask,
            opacity: el.opacity as f32,
        });
        Ok(())
    }
}

/// Element-local -> canvas transform: rotation is about the element center.
fn element_transform(el: &Element) -> kurbo::Affine {
    let translate = kurbo::Affine::translate(kurbo::Vec2::new(el.x, el.y));
    if el.rotation == 0.0 {
        return translate;
    }
    let anchor = kurbo::Vec2::new(el.width / 2.0, el.height / 2.0);
    translate
        * kurbo::Affine::translate(anchor)
        * kurbo::Affine::rotate(el.rotation.to_radians())
        * kurbo::Affine::translate(-anchor)
}

fn push_shape(surface: &mut Surface, el: &Element, props: &ShapeProps) -> PinforgeResult<()> {
    let transform = element_transform(el);
    let opacity = el.opacity as f32;

    match props.shape {
        ShapeKind::Rect => {
            let path = if props.corner_radius > 0.0 {
                kurbo::RoundedRect::new(0.0, 0.0, el.width, el.height, props.corner_radius)
                    .to_path(PATH_TOLERANCE)
            } else {
                kurbo::Rect::new(0.0, 0.0, el.width, el.height).to_path(PATH_TOLERANCE)
            };
            push_fill_and_stroke(surface, props, path, transform, opacity)?;
        }
        ShapeKind::Circle => {
            let path = kurbo::Ellipse::new(
                kurbo::Point::new(el.width / 2.0, el.height / 2.0),
                kurbo::Vec2::new(el.width / 2.0, el.height / 2.0),
                0.0,
            )
            .to_path(PATH_TOLERANCE);
            push_fill_and_stroke(surface, props, path, transform, opacity)?;
        }
        ShapeKind::Line => {
            let path = polyline(&props.points)?;
            let color = line_color(props)?;
            surface.push(DrawOp::StrokePath {
                path,
                transform,
                color,
                width: props.stroke_width.max(1.0),
                opacity,
            });
        }
        ShapeKind::Arrow => {
            let path = polyline(&props.points)?;
            let color = line_color(props)?;
            let width = props.stroke_width.max(1.0);
            let head = arrow_head(&props.points, width)?;
            surface.push(DrawOp::StrokePath {
                path,
                transform,
                color,
                width,
                opacity,
            });
            surface.push(DrawOp::FillPath {
                path: head,
                transform,
                color,
                opacity,
            });
        }
        ShapeKind::Path => {
            let d = props.path_data.as_deref().unwrap_or_default();
            let path = kurbo::BezPath::from_svg(d)
                .map_err(|e| PinforgeError::validation(format!("invalid path data: {e}")))?;
            push_fill_and_stroke(surface, props, path, transform, opacity)?;
        }
    }
    Ok(())
}

fn push_fill_and_stroke(
    surface: &mut Surface,
    props: &ShapeProps,
    path: kurbo::BezPath,
    transform: kurbo::Affine,
    opacity: f32,
) -> PinforgeResult<()> {
    let fill = parse_hex_color(&props.fill)?;
    let stroke = props
        .stroke
        .as_deref()
        .map(parse_hex_color)
        .transpose()?
        .filter(|c| c.a > 0 && props.stroke_width > 0.0);

    if fill.a > 0 {
        surface.push(DrawOp::FillPath {
            path: path.clone(),
            transform,
            color: fill,
            opacity,
        });
    }
    if let Some(color) = stroke {
        surface.push(DrawOp::StrokePath {
            path,
            transform,
            color,
            width: props.stroke_width,
            opacity,
        });
    }
    Ok(())
}

fn line_color(props: &ShapeProps) -> PinforgeResult<Rgba8> {
    match props.stroke.as_deref() {
        Some(s) => parse_hex_color(s),
        None => parse_hex_color(&props.fill),
    }
}

fn polyline(points: &[[f64; 2]]) -> PinforgeResult<kurbo::BezPath> {
    if points.len() < 2 {
        return Err(PinforgeError::validation(
            "line/arrow needs at least 2 points",
        ));
    }
    let mut path = kurbo::BezPath::new();
    path.move_to(kurbo::Point::new(points[0][0], points[0][1]));
    for p in &points[1..] {
        path.line_to(kurbo::Point::new(p[0], p[1]));
    }
    Ok(path)
}

/// Filled triangle head at the last segment's tip.
fn arrow_head(points: &[[f64; 2]], stroke_width: f64) -> PinforgeResult<kurbo::BezPath> {
    if points.len() < 2 {
        return Err(PinforgeError::validation("arrow needs at least 2 points"));
    }
    let tip = kurbo::Point::new(points[points.len() - 1][0], points[points.len() - 1][1]);
    let prev = kurbo::Point::new(points[points.len() - 2][0], points[points.len() - 2][1]);
    let delta = tip - prev;
    let length = delta.hypot();
    if length == 0.0 || !length.is_finite() {
        return Err(PinforgeError::validation("arrow has zero-length tip segment"));
    }
    let dir = delta / length;

    let len = (stroke_width * 4.0).max(8.0);
    let half = len * 0.5;
    let base = tip - dir * len;
    let normal = kurbo::Vec2::new(-dir.y, dir.x);

    let mut head = kurbo::BezPath::new();
    head.move_to(tip);
    head.line_to(base + normal * half);
    head.line_to(base - normal * half);
    head.close_path();
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::decode::PreparedImage;
    use async_trait::async_trait;

    struct NoImages;

    #[async_trait]
    impl ImageSource for NoImages {
        async fn load(&self, _src: &str) -> PinforgeResult<PreparedImage> {
            Err(PinforgeError::image("no external images in this test"))
        }
    }

    fn renderer() -> TemplateRenderer {
        TemplateRenderer::new(Arc::new(Mutex::new(TextEngine::new())), Arc::new(NoImages))
    }

    fn shape_json(id: &str, z: i32, visible: bool, fill: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "name": id,
            "type": "shape",
            "shape": "rect",
            "x": 0.0, "y": 0.0, "width": 8.0, "height": 8.0,
            "zIndex": z,
            "visible": visible,
            "fill": fill,
        })
    }

    fn config() -> RenderConfig {
        RenderConfig {
            width: 8,
            height: 8,
            background_color: "#000000".to_string(),
            interactive: false,
        }
    }

    #[tokio::test]
    async fn invisible_elements_produce_no_drawables() {
        let elements: Vec<Element> = vec![
            serde_json::from_value(shape_json("a", 0, true, "#ff0000")).unwrap(),
            serde_json::from_value(shape_json("b", 1, false, "#00ff00")).unwrap(),
        ];
        let mut surface = Surface::new(8, 8).unwrap();
        renderer()
            .render(
                &mut surface,
                &elements,
                &config(),
                &RowData::default(),
                &FieldMapping::default(),
            )
            .await
            .unwrap();
        assert_eq!(surface.op_count(), 1);
    }

    #[tokio::test]
    async fn z_order_decides_which_pixel_wins() {
        // Lower z listed last: sorting must put it underneath anyway.
        let elements: Vec<Element> = vec![
            serde_json::from_value(shape_json("top", 5, true, "#00ff00")).unwrap(),
            serde_json::from_value(shape_json("bottom", 1, true, "#ff0000")).unwrap(),
        ];
        let mut surface = Surface::new(8, 8).unwrap();
        renderer()
            .render(
                &mut surface,
                &elements,
                &config(),
                &RowData::default(),
                &FieldMapping::default(),
            )
            .await
            .unwrap();
        assert_eq!(&surface.pixels()[..4], &[0, 255, 0, 255]);
    }

    #[tokio::test]
    async fn caller_order_is_not_mutated() {
        let elements: Vec<Element> = vec![
            serde_json::from_value(shape_json("top", 5, true, "#00ff00")).unwrap(),
            serde_json::from_value(shape_json("bottom", 1, true, "#ff0000")).unwrap(),
        ];
        let mut surface = Surface::new(8, 8).unwrap();
        renderer()
            .render(
                &mut surface,
                &elements,
                &config(),
                &RowData::default(),
                &FieldMapping::default(),
            )
            .await
            .unwrap();
        assert_eq!(elements[0].id, "top");
        assert_eq!(elements[1].id, "bottom");
    }

    #[tokio::test]
    async fn failing_image_load_fails_the_render() {
        let json = serde_json::json!({
            "id": "img", "name": "img", "type": "image",
            "width": 8.0, "height": 8.0,
            "src": "https://example.com/a.png",
        });
        let elements: Vec<Element> = vec![serde_json::from_value(json).unwrap()];
        let mut surface = Surface::new(8, 8).unwrap();
        let err = renderer()
            .render(
                &mut surface,
                &elements,
                &config(),
                &RowData::default(),
                &FieldMapping::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("image error"));
    }

    #[test]
    fn rotation_transform_is_anchored_at_center() {
        let el: Element = serde_json::from_value(serde_json::json!({
            "id": "r", "name": "r", "type": "shape", "shape": "rect",
            "x": 10.0, "y": 10.0, "width": 4.0, "height": 4.0,
            "rotation": 180.0,
        }))
        .unwrap();
        let t = element_transform(&el);
        // The center point is a fixed point of rotation about the center.
        let center = t * kurbo::Point::new(2.0, 2.0);
        assert!((center.x - 12.0).abs() < 1e-9);
        assert!((center.y - 12.0).abs() < 1e-9);
        // A corner lands on the opposite corner.
        let corner = t * kurbo::Point::new(0.0, 0.0);
        assert!((corner.x - 14.0).abs() < 1e-9);
        assert!((corner.y - 14.0).abs() < 1e-9);
    }
}
