use std::collections::HashSet;

use crate::foundation::{
    color::parse_hex_color,
    error::{PinforgeError, PinforgeResult},
};

/// Template document: the element list plus canvas configuration.
///
/// This is a read-only input to the rendering core. The renderer never
/// mutates a template; per-row state lives in [`crate::RowData`].
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub elements: Vec<Element>,
    pub canvas_size: CanvasSize,
    #[serde(default = "default_background")]
    pub background_color: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CanvasSize {
    pub width: u32,
    pub height: u32,
}

/// One positioned visual primitive.
///
/// The wire format is the editor's camelCase JSON with a `"type"` tag
/// selecting the variant; unknown fields are tolerated because the editor
/// model evolves independently of this crate.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Element {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Rotation in degrees about the element center.
    #[serde(default)]
    pub rotation: f64,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    #[serde(default)]
    pub z_index: i32,
    #[serde(default = "default_true")]
    pub visible: bool,
    /// Editor-only flag; locked elements still render.
    #[serde(default)]
    pub locked: bool,
    #[serde(flatten)]
    pub kind: ElementKind,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ElementKind {
    Text(TextProps),
    Image(ImageProps),
    Shape(ShapeProps),
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextProps {
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_font_family")]
    pub font_family: String,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default)]
    pub font_style: FontStyle,
    #[serde(default = "default_text_fill")]
    pub fill: String,
    #[serde(default)]
    pub align: TextAlign,
    /// Multiplier over the font size.
    #[serde(default = "default_line_height")]
    pub line_height: f32,
    #[serde(default)]
    pub letter_spacing: f32,
    #[serde(default)]
    pub stroke: Option<TextStroke>,
    #[serde(default)]
    pub shadow: Option<TextShadow>,
    /// Box background color behind the text, if any.
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextStroke {
    pub color: String,
    #[serde(default = "default_stroke_width")]
    pub width: f64,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextShadow {
    pub color: String,
    #[serde(default)]
    pub offset_x: f64,
    #[serde(default)]
    pub offset_y: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FontStyle {
    #[default]
    Normal,
    Bold,
    Italic,
    BoldItalic,
}

impl FontStyle {
    pub fn is_bold(self) -> bool {
        matches!(self, Self::Bold | Self::BoldItalic)
    }

    pub fn is_italic(self) -> bool {
        matches!(self, Self::Italic | Self::BoldItalic)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageProps {
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub corner_radius: f64,
    #[serde(default)]
    pub fit: ImageFit,
    #[serde(default)]
    pub is_dynamic: bool,
    #[serde(default)]
    pub field: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFit {
    /// Scale uniformly to cover the box, cropping overflow.
    #[default]
    Cover,
    /// Scale uniformly to fit inside the box, leaving gaps.
    Contain,
    /// Stretch to the box, ignoring aspect ratio.
    Fill,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeProps {
    pub shape: ShapeKind,
    #[serde(default = "default_shape_fill")]
    pub fill: String,
    #[serde(default)]
    pub stroke: Option<String>,
    #[serde(default = "default_stroke_width")]
    pub stroke_width: f64,
    /// Rect corner radius in px.
    #[serde(default)]
    pub corner_radius: f64,
    /// Element-local points for line/arrow kinds.
    #[serde(default)]
    pub points: Vec<[f64; 2]>,
    /// SVG path data for the path kind.
    #[serde(default)]
    pub path_data: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Rect,
    Circle,
    Line,
    Arrow,
    Path,
}

/// Canvas + background + mode for a single render.
///
/// `interactive` distinguishes editor live-preview from headless batch
/// export; batch mode is always non-interactive and no selection/event
/// wiring exists server-side.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_background")]
    pub background_color: String,
    #[serde(default)]
    pub interactive: bool,
}

impl RenderConfig {
    pub fn batch(canvas: CanvasSize, background_color: impl Into<String>) -> Self {
        Self {
            width: canvas.width,
            height: canvas.height,
            background_color: background_color.into(),
            interactive: false,
        }
    }
}

pub(crate) fn default_background() -> String {
    "#ffffff".to_string()
}

fn default_opacity() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_font_family() -> String {
    "Inter".to_string()
}

fn default_font_size() -> f32 {
    24.0
}

fn default_text_fill() -> String {
    "#000000".to_string()
}

fn default_line_height() -> f32 {
    1.2
}

fn default_shape_fill() -> String {
    "#cccccc".to_string()
}

fn default_stroke_width() -> f64 {
    1.0
}

impl Template {
    pub fn validate(&self) -> PinforgeResult<()> {
        validate_canvas(&self.canvas_size)?;
        parse_hex_color(&self.background_color)?;
        validate_elements(&self.elements)
    }
}

pub fn validate_canvas(canvas: &CanvasSize) -> PinforgeResult<()> {
    if canvas.width == 0 || canvas.height == 0 {
        return Err(PinforgeError::validation("canvas width/height must be > 0"));
    }
    // The CPU raster backend addresses surfaces with u16 coordinates.
    if canvas.width > u32::from(u16::MAX) || canvas.height > u32::from(u16::MAX) {
        return Err(PinforgeError::validation(format!(
            "canvas {}x{} exceeds the maximum renderable size {}",
            canvas.width,
            canvas.height,
            u16::MAX
        )));
    }
    Ok(())
}

pub fn validate_elements(elements: &[Element]) -> PinforgeResult<()> {
    let mut seen = HashSet::new();
    for el in elements {
        if el.id.trim().is_empty() {
            return Err(PinforgeError::validation("element id must be non-empty"));
        }
        if !seen.insert(el.id.as_str()) {
            return Err(PinforgeError::validation(format!(
                "duplicate element id '{}'",
                el.id
            )));
        }
        if !el.opacity.is_finite() || !(0.0..=1.0).contains(&el.opacity) {
            return Err(PinforgeError::validation(format!(
                "element '{}' opacity must be within [0, 1]",
                el.id
            )));
        }
        if !(el.width.is_finite() && el.height.is_finite()) || el.width < 0.0 || el.height < 0.0 {
            return Err(PinforgeError::validation(format!(
                "element '{}' has invalid size",
                el.id
            )));
        }

        match &el.kind {
            ElementKind::Text(t) => {
                if !t.font_size.is_finite() || t.font_size <= 0.0 {
                    return Err(PinforgeError::validation(format!(
                        "element '{}' font size must be finite and > 0",
                        el.id
                    )));
                }
            }
            ElementKind::Image(_) => {}
            ElementKind::Shape(s) => match s.shape {
                ShapeKind::Line | ShapeKind::Arrow => {
                    if s.points.len() < 2 {
                        return Err(PinforgeError::validation(format!(
                            "element '{}' needs at least 2 points",
                            el.id
                        )));
                    }
                }
                ShapeKind::Path => {
                    if s.path_data.as_deref().is_none_or(|d| d.trim().is_empty()) {
                        return Err(PinforgeError::validation(format!(
                            "element '{}' path data must be non-empty",
                            el.id
                        )));
                    }
                }
                ShapeKind::Rect | ShapeKind::Circle => {}
            },
        }
    }
    Ok(())
}
