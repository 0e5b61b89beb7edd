use crate::batch::render_certificate;
use crate::canvas::SurfaceFactory;
use crate::error::{CertStampError, ValidationError};
use crate::model::{ColumnMapping, DataRow, FieldDefinition};
use crate::perf::PerfLog;
use crate::render::FieldRenderer;
use crate::resolve::{FieldValues, ResolveMode};
use crate::template::Template;
use crate::types::PixelSize;

pub const PREVIEW_FILE_NAME: &str = "certificate-preview.png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewOutput {
    pub file_name: String,
    pub png: Vec<u8>,
}

/// A preview needs a template and at least one field. Rows are optional.
pub fn validate_preview(
    template: Option<&Template>,
    fields: &[FieldDefinition],
) -> Result<(), CertStampError> {
    if template.is_none() {
        return Err(ValidationError::MissingTemplate.into());
    }
    if fields.is_empty() {
        return Err(ValidationError::NoFields.into());
    }
    Ok(())
}

/// Renders the first row, or field names as placeholders when there are no
/// rows, to a single PNG. Never packages and never touches session state.
#[allow(clippy::too_many_arguments)]
pub fn render_preview<F: SurfaceFactory>(
    factory: &F,
    renderer: &FieldRenderer,
    template: &Template,
    fields: &[FieldDefinition],
    mapping: &ColumnMapping,
    rows: &[DataRow],
    fallback_canvas_size: PixelSize,
    perf: Option<&PerfLog>,
) -> Result<PreviewOutput, CertStampError> {
    validate_preview(Some(template), fields)?;
    let empty = DataRow::new();
    let row = rows.first().unwrap_or(&empty);
    let values = FieldValues::resolve(fields, mapping, row, ResolveMode::Preview);
    let size = template.output_size(fallback_canvas_size);
    let png = render_certificate(factory, renderer, template, fields, &values, size, perf, None)?;
    Ok(PreviewOutput {
        file_name: PREVIEW_FILE_NAME.to_string(),
        png,
    })
}
