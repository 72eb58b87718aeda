use std::{collections::BTreeMap, path::Path, sync::Arc};

use crate::{
    foundation::error::{PinforgeError, PinforgeResult},
    template::model::{FontStyle, TextAlign},
};

/// RGBA8 brush color carried through Parley text layout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextBrushRgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

/// A shaped layout plus the font bytes needed to rasterize its glyphs.
#[derive(Clone)]
pub struct TextLayout {
    pub layout: Arc<parley::Layout<TextBrushRgba8>>,
    pub font_bytes: Arc<Vec<u8>>,
}

impl std::fmt::Debug for TextLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextLayout")
            .field("layout_ptr", &Arc::as_ptr(&self.layout))
            .field("font_bytes_len", &self.font_bytes.len())
            .finish()
    }
}

/// Everything needed to shape one text element's content.
#[derive(Clone, Debug)]
pub struct TextSpec<'a> {
    pub text: &'a str,
    pub family: &'a str,
    pub size: f32,
    pub style: FontStyle,
    pub brush: TextBrushRgba8,
    pub line_height: f32,
    pub letter_spacing: f32,
    pub max_width: f32,
    pub align: TextAlign,
}

struct RegisteredFont {
    family: String,
    bytes: Arc<Vec<u8>>,
}

/// Explicitly constructed text layout/measurement service.
///
/// Holds the Parley font and layout contexts plus a registry of loaded font
/// families. Constructed once per host (CLI run, server) and passed into the
/// renderer; tests build fresh instances so nothing leaks across them.
pub struct TextEngine {
    font_ctx: parley::FontContext,
    layout_ctx: parley::LayoutContext<TextBrushRgba8>,
    families: BTreeMap<String, RegisteredFont>,
    default_family: Option<String>,
}

impl Default for TextEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TextEngine {
    pub fn new() -> Self {
        Self {
            font_ctx: parley::FontContext::default(),
            layout_ctx: parley::LayoutContext::new(),
            families: BTreeMap::new(),
            default_family: None,
        }
    }

    /// Register a font from raw bytes; returns the detected family name.
    ///
    /// The first registered family becomes the fallback for unknown families.
    pub fn register_font(&mut self, bytes: Vec<u8>) -> PinforgeResult<String> {
        let bytes = Arc::new(bytes);
        let families = self
            .font_ctx
            .collection
            .register_fonts(parley::fontique::Blob::from(bytes.as_ref().clone()), None);
        let family_id = families.first().map(|(id, _)| *id).ok_or_else(|| {
            PinforgeError::validation("no font families registered from font bytes")
        })?;
        let family_name = self
            .font_ctx
            .collection
            .family_name(family_id)
            .ok_or_else(|| PinforgeError::validation("registered font family has no name"))?
            .to_string();

        let key = family_name.to_lowercase();
        self.families.insert(
            key.clone(),
            RegisteredFont {
                family: family_name.clone(),
                bytes,
            },
        );
        if self.default_family.is_none() {
            self.default_family = Some(key);
        }
        Ok(family_name)
    }

    /// Register every `.ttf`/`.otf`/`.ttc` file in a directory; returns the
    /// number of fonts loaded. Unreadable files are skipped.
    pub fn load_fonts_dir(&mut self, dir: &Path) -> usize {
        let Ok(rd) = std::fs::read_dir(dir) else {
            return 0;
        };

        let mut loaded = 0;
        for entry in rd.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(ext) = path.extension().and_then(|s| s.to_str()) else {
                continue;
            };
            let ext = ext.to_ascii_lowercase();
            if ext != "ttf" && ext != "otf" && ext != "ttc" {
                continue;
            }
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            match self.register_font(bytes) {
                Ok(family) => {
                    tracing::debug!(path = %path.display(), family, "registered font");
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping font file");
                }
            }
        }
        loaded
    }

    pub fn has_fonts(&self) -> bool {
        !self.families.is_empty()
    }

    fn resolve_family(&self, requested: &str) -> PinforgeResult<&RegisteredFont> {
        if let Some(font) = self.families.get(&requested.trim().to_lowercase()) {
            return Ok(font);
        }
        self.default_family
            .as_ref()
            .and_then(|key| self.families.get(key))
            .ok_or_else(|| {
                PinforgeError::validation(format!(
                    "no font registered for family '{requested}' and no fallback font is loaded"
                ))
            })
    }

    /// Shape and lay out one text run with wrapping at `max_width`.
    pub fn layout(&mut self, spec: &TextSpec<'_>) -> PinforgeResult<TextLayout> {
        if !spec.size.is_finite() || spec.size <= 0.0 {
            return Err(PinforgeError::validation(
                "text size must be finite and > 0",
            ));
        }

        let (family_name, font_bytes) = {
            let font = self.resolve_family(spec.family)?;
            (font.family.clone(), font.bytes.clone())
        };

        let mut builder = self
            .layout_ctx
            .ranged_builder(&mut self.font_ctx, spec.text, 1.0, true);
        builder.push_default(parley::style::StyleProperty::FontStack(
            parley::style::FontStack::Source(std::borrow::Cow::Owned(family_name)),
        ));
        builder.push_default(parley::style::StyleProperty::FontSize(spec.size));
        builder.push_default(parley::style::StyleProperty::Brush(spec.brush));
        builder.push_default(parley::style::StyleProperty::LineHeight(
            parley::LineHeight::FontSizeRelative(spec.line_height.max(0.1)),
        ));
        if spec.letter_spacing != 0.0 {
            builder.push_default(parley::style::StyleProperty::LetterSpacing(
                spec.letter_spacing,
            ));
        }
        if spec.style.is_bold() {
            builder.push_default(parley::style::StyleProperty::FontWeight(
                parley::style::FontWeight::BOLD,
            ));
        }
        if spec.style.is_italic() {
            builder.push_default(parley::style::StyleProperty::FontStyle(
                parley::style::FontStyle::Italic,
            ));
        }

        let mut layout: parley::Layout<TextBrushRgba8> = builder.build(spec.text);
        let max_width = if spec.max_width.is_finite() && spec.max_width > 0.0 {
            Some(spec.max_width)
        } else {
            None
        };
        layout.break_all_lines(max_width);
        let alignment = match spec.align {
            TextAlign::Left => parley::Alignment::Start,
            TextAlign::Center => parley::Alignment::Center,
            TextAlign::Right => parley::Alignment::End,
        };
        layout.align(max_width, alignment, parley::AlignmentOptions::default());

        Ok(TextLayout {
            layout: Arc::new(layout),
            font_bytes,
        })
    }
}
