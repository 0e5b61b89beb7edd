#![allow(unsafe_op_in_unsafe_fn)]

use crate::{
    BatchInput, CertStamp, CertStampBuilder, CertStampError, ColumnMapping, DataRow,
    FieldDefinition, NoopObserver, PixelSize, Template,
};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict, PyList, PyModule};
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[pyclass(name = "CertificateEngine")]
struct PyCertificateEngine {
    engine: CertStamp,
}

#[pymethods]
impl PyCertificateEngine {
    #[new]
    #[pyo3(
        signature = (
            font_dirs=None,
            font_files=None,
            shape_text=true,
            system_fonts=true,
            fallback_width=1200,
            fallback_height=850,
            reference_width=800,
            max_archive_bytes=None,
            packaging_date=None,
            event_log=None,
            perf_log=None
        )
    )]
    #[allow(clippy::too_many_arguments)]
    fn new(
        font_dirs: Option<Vec<String>>,
        font_files: Option<Vec<String>>,
        shape_text: bool,
        system_fonts: bool,
        fallback_width: u32,
        fallback_height: u32,
        reference_width: u32,
        max_archive_bytes: Option<u64>,
        packaging_date: Option<String>,
        event_log: Option<String>,
        perf_log: Option<String>,
    ) -> PyResult<Self> {
        let mut builder = CertStampBuilder::new()
            .shape_text(shape_text)
            .use_system_fonts(system_fonts)
            .fallback_canvas_size(PixelSize::new(fallback_width, fallback_height))
            .reference_width_fallback(reference_width)
            .max_archive_bytes(max_archive_bytes);
        for dir in font_dirs.unwrap_or_default() {
            builder = builder.register_font_dir(dir);
        }
        for file in font_files.unwrap_or_default() {
            builder = builder.register_font_file(file);
        }
        if let Some(raw) = packaging_date.as_deref() {
            let date = chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|err| {
                PyValueError::new_err(format!("packaging_date must be YYYY-MM-DD: {err}"))
            })?;
            builder = builder.packaging_date(date);
        }
        if let Some(path) = event_log {
            builder = builder.event_log(path);
        }
        if let Some(path) = perf_log {
            builder = builder.perf_log(path);
        }
        let engine = builder.build().map_err(to_py_err)?;
        Ok(Self { engine })
    }

    fn register_font(&self, path: &str) -> PyResult<String> {
        self.engine.fonts().register_file(path).map_err(to_py_err)
    }

    /// Returns `(file_name, png_bytes)`.
    #[pyo3(signature = (template, fields_json, mapping_json="{}", rows_json="[]"))]
    fn render_preview(
        &self,
        py: Python<'_>,
        template: &str,
        fields_json: &str,
        mapping_json: &str,
        rows_json: &str,
    ) -> PyResult<(String, Py<PyBytes>)> {
        let (template, fields, mapping, rows) =
            parse_inputs(template, fields_json, mapping_json, rows_json)?;
        let preview = py
            .allow_threads(|| {
                self.engine
                    .preview_blocking(&template, &fields, &mapping, &rows)
            })
            .map_err(to_py_err)?;
        Ok((
            preview.file_name,
            PyBytes::new_bound(py, &preview.png).unbind(),
        ))
    }

    /// Returns a dict with `archive_name`, `archive`, `entries`, `skipped`,
    /// `total_rows` and `sha256`.
    #[pyo3(signature = (template, fields_json, mapping_json, rows_json))]
    fn render_batch(
        &self,
        py: Python<'_>,
        template: &str,
        fields_json: &str,
        mapping_json: &str,
        rows_json: &str,
    ) -> PyResult<PyObject> {
        let (template, fields, mapping, rows) =
            parse_inputs(template, fields_json, mapping_json, rows_json)?;
        let input = BatchInput::new(Some(Arc::new(template)), fields, mapping, rows)
            .map_err(to_py_err)?;
        let output = py
            .allow_threads(|| {
                self.engine
                    .run_batch_blocking(&input, &mut NoopObserver, None)
            })
            .map_err(to_py_err)?;

        let out = PyDict::new_bound(py);
        out.set_item("archive_name", &output.archive_name)?;
        out.set_item("sha256", sha256_hex(&output.archive))?;
        out.set_item("archive", PyBytes::new_bound(py, &output.archive))?;
        out.set_item("entries", PyList::new_bound(py, &output.entries))?;
        let skipped = PyList::empty_bound(py);
        for failure in &output.skipped {
            let item = PyDict::new_bound(py);
            item.set_item("row_index", failure.row_index)?;
            item.set_item("reason", &failure.reason)?;
            skipped.append(item)?;
        }
        out.set_item("skipped", skipped)?;
        out.set_item("total_rows", output.total_rows)?;
        Ok(out.to_object(py))
    }
}

fn parse_inputs(
    template: &str,
    fields_json: &str,
    mapping_json: &str,
    rows_json: &str,
) -> PyResult<(Template, Vec<FieldDefinition>, ColumnMapping, Vec<DataRow>)> {
    let template = Template::load(template).map_err(to_py_err)?;
    let fields = FieldDefinition::list_from_json(fields_json).map_err(to_py_err)?;
    let mapping = ColumnMapping::from_json(mapping_json).map_err(to_py_err)?;
    let rows = DataRow::rows_from_json(rows_json).map_err(to_py_err)?;
    Ok((template, fields, mapping, rows))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[pymodule]
fn _certstamp(_py: Python<'_>, module: &Bound<'_, PyModule>) -> PyResult<()> {
    module.add_class::<PyCertificateEngine>()?;
    Ok(())
}

fn to_py_err(err: CertStampError) -> PyErr {
    PyValueError::new_err(err.to_string())
}
