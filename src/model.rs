use crate::error::CertStampError;
use crate::types::Color;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_FONT_FAMILY: &str = "Inter";
pub const DEFAULT_FONT_SIZE: f32 = 24.0;
pub const DEFAULT_FIELD_COLOR: &str = "#000000";

fn default_position() -> f32 {
    50.0
}

fn default_font_size() -> f32 {
    DEFAULT_FONT_SIZE
}

fn default_color() -> String {
    DEFAULT_FIELD_COLOR.to_string()
}

/// One placeable text element, in the editor's JSON shape.
///
/// `x`/`y` are percentages (0..=100) of the surface being drawn on and mark
/// the visual center of the text. `font_size` is relative to the template's
/// native width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_position")]
    pub x: f32,
    #[serde(default = "default_position")]
    pub y: f32,
    #[serde(default = "default_font_size")]
    pub font_size: f32,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font_family: Option<String>,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub underline: bool,
}

impl FieldDefinition {
    pub fn named(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            x: default_position(),
            y: default_position(),
            font_size: DEFAULT_FONT_SIZE,
            color: default_color(),
            font_family: None,
            bold: false,
            italic: false,
            underline: false,
        }
    }

    pub fn family(&self) -> &str {
        match self.font_family.as_deref().map(str::trim) {
            Some(family) if !family.is_empty() => family,
            _ => DEFAULT_FONT_FAMILY,
        }
    }

    pub fn fill_color(&self) -> Color {
        Color::parse_or_black(&self.color)
    }

    pub fn list_from_json(raw: &str) -> Result<Vec<FieldDefinition>, CertStampError> {
        serde_json::from_str(raw)
            .map_err(|err| CertStampError::InvalidConfiguration(format!("field list: {err}")))
    }
}

/// Field name -> data column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnMapping(BTreeMap<String, String>);

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field_name: impl Into<String>, column: impl Into<String>) {
        self.0.insert(field_name.into(), column.into());
    }

    pub fn with(mut self, field_name: impl Into<String>, column: impl Into<String>) -> Self {
        self.insert(field_name, column);
        self
    }

    pub fn column_for(&self, field_name: &str) -> Option<&str> {
        self.0.get(field_name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn from_json(raw: &str) -> Result<ColumnMapping, CertStampError> {
        serde_json::from_str(raw)
            .map_err(|err| CertStampError::InvalidConfiguration(format!("column mapping: {err}")))
    }
}

/// Column name -> cell value. Values are always strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataRow(BTreeMap<String, String>);

impl DataRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn rows_from_json(raw: &str) -> Result<Vec<DataRow>, CertStampError> {
        serde_json::from_str(raw)
            .map_err(|err| CertStampError::InvalidConfiguration(format!("data rows: {err}")))
    }
}
