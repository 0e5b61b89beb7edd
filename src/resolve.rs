use crate::model::{ColumnMapping, DataRow, FieldDefinition};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Missing mapping or empty cell renders as an empty string.
    Batch,
    /// Missing mapping or empty cell renders the field's own name.
    Preview,
}

/// Literal text for one field on one row. Never fails.
pub fn resolve_value(
    field: &FieldDefinition,
    mapping: &ColumnMapping,
    row: &DataRow,
    mode: ResolveMode,
) -> String {
    let mapped = mapping
        .column_for(&field.name)
        .filter(|column| !column.is_empty())
        .and_then(|column| row.get(column))
        .filter(|value| !value.is_empty());
    match (mapped, mode) {
        (Some(value), _) => value.to_string(),
        (None, ResolveMode::Batch) => String::new(),
        (None, ResolveMode::Preview) => field.name.clone(),
    }
}

/// Resolved text keyed by field id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValues(HashMap<String, String>);

impl FieldValues {
    pub fn resolve(
        fields: &[FieldDefinition],
        mapping: &ColumnMapping,
        row: &DataRow,
        mode: ResolveMode,
    ) -> Self {
        Self(
            fields
                .iter()
                .map(|field| (field.id.clone(), resolve_value(field, mapping, row, mode)))
                .collect(),
        )
    }

    pub fn insert(&mut self, field_id: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field_id.into(), value.into());
    }

    pub fn get(&self, field_id: &str) -> &str {
        self.0.get(field_id).map(String::as_str).unwrap_or("")
    }
}
