use std::collections::BTreeMap;

use crate::template::model::{Element, ImageProps, TextProps};

/// Template field name -> CSV column name.
///
/// Backed by a `BTreeMap` so iteration order (and therefore the winner of
/// first-match-wins fallback resolution) is deterministic.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct FieldMapping(BTreeMap<String, String>);

impl FieldMapping {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn column_for(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Resolve a template field to the row's value.
    ///
    /// Unmapped fields and missing columns resolve to `None`, never an error.
    pub fn value_for<'a>(&self, row: &'a RowData, field: &str) -> Option<&'a str> {
        self.column_for(field).and_then(|col| row.get(col))
    }

    /// Last-resort name matching: case-insensitive substring containment in
    /// either direction between the element name and each mapping key, first
    /// match wins.
    pub fn fuzzy_value<'a>(&self, row: &'a RowData, name: &str) -> Option<&'a str> {
        let needle = name.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        for (field, column) in &self.0 {
            let key = field.to_lowercase();
            if needle.contains(&key) || key.contains(&needle) {
                return row.get(column);
            }
        }
        None
    }

    /// Fuzzy matching with whitespace stripped from both sides, used for
    /// image source resolution where element names like "Product Image 1"
    /// should match a "productimage" field.
    pub fn fuzzy_value_normalized<'a>(&self, row: &'a RowData, name: &str) -> Option<&'a str> {
        let needle = strip_whitespace(&name.to_lowercase());
        if needle.is_empty() {
            return None;
        }
        for (field, column) in &self.0 {
            let key = strip_whitespace(&field.to_lowercase());
            if !key.is_empty() && (needle.contains(&key) || key.contains(&needle)) {
                return row.get(column);
            }
        }
        None
    }
}

impl FromIterator<(String, String)> for FieldMapping {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// One CSV record: column name -> value. Immutable input to a single render.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct RowData(BTreeMap<String, String>);

impl RowData {
    pub fn new(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }

    /// Non-empty value for a column, if present.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0
            .get(column)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

impl FromIterator<(String, String)> for RowData {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn contains_token(s: &str) -> bool {
    s.contains("{{")
}

/// Replace every `{{field}}` token with the mapped row value.
///
/// Unresolved tokens are removed, not left verbatim. Malformed trailing
/// `{{` without a closing brace is emitted as-is.
pub fn substitute_tokens(text: &str, mapping: &FieldMapping, row: &RowData) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let field = after[..end].trim();
                if let Some(value) = mapping.value_for(row, field) {
                    out.push_str(value);
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Resolve the text content one element renders for one row.
///
/// Order: explicit dynamic binding, then `{{token}}` substitution, then the
/// name-based fallback. The fallback only applies to elements that opted
/// into dynamic content (dynamic flag or tokens) and only when the earlier
/// steps produced nothing; literal text is never second-guessed.
pub fn resolve_text_content(
    element: &Element,
    props: &TextProps,
    mapping: &FieldMapping,
    row: &RowData,
) -> String {
    let had_tokens = contains_token(&props.text);
    let mut dynamic = had_tokens;

    let mut content = props.text.clone();
    if props.is_dynamic {
        dynamic = true;
        if let Some(field) = props.field.as_deref() {
            content = mapping.value_for(row, field).unwrap_or_default().to_string();
        }
    }

    if contains_token(&content) {
        content = substitute_tokens(&content, mapping, row);
    }

    if dynamic && content.trim().is_empty() {
        if let Some(value) = mapping.fuzzy_value(row, &element.name) {
            return value.to_string();
        }
    }
    content
}

pub fn looks_like_image_url(s: &str) -> bool {
    let s = s.trim();
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("data:")
}

/// Resolve the source URL an image element loads for one row.
///
/// Priority: explicit dynamic binding (when the value looks like a URL),
/// inline `{{token}}`s in the stored src, whitespace-normalized name
/// matching, then the literal stored src.
pub fn resolve_image_source(
    element: &Element,
    props: &ImageProps,
    mapping: &FieldMapping,
    row: &RowData,
) -> String {
    if props.is_dynamic {
        if let Some(field) = props.field.as_deref() {
            if let Some(value) = mapping.value_for(row, field) {
                if looks_like_image_url(value) {
                    return value.to_string();
                }
            }
        }
    }

    if contains_token(&props.src) {
        let substituted = substitute_tokens(&props.src, mapping, row);
        if !substituted.trim().is_empty() {
            return substituted;
        }
    }

    if let Some(value) = mapping.fuzzy_value_normalized(row, &element.name) {
        if looks_like_image_url(value) {
            return value.to_string();
        }
    }

    props.src.clone()
}
