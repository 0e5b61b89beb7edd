use crate::archive::{EntryNames, package};
use crate::canvas::{Canvas, SurfaceFactory};
use crate::debug::EventLog;
use crate::error::{CertStampError, ValidationError};
use crate::geometry::FALLBACK_CANVAS_SIZE;
use crate::model::{ColumnMapping, DataRow, FieldDefinition};
use crate::perf::{PerfLog, timed};
use crate::render::FieldRenderer;
use crate::resolve::{FieldValues, ResolveMode, resolve_value};
use crate::template::Template;
use crate::types::PixelSize;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything one batch reads, assembled and validated up front.
#[derive(Debug, Clone)]
pub struct BatchInput {
    template: Arc<Template>,
    fields: Vec<FieldDefinition>,
    mapping: ColumnMapping,
    rows: Vec<DataRow>,
}

impl BatchInput {
    /// Fails with the user-facing validation error when the template is
    /// missing, no field is defined or the dataset is empty.
    pub fn new(
        template: Option<Arc<Template>>,
        fields: Vec<FieldDefinition>,
        mapping: ColumnMapping,
        rows: Vec<DataRow>,
    ) -> Result<Self, CertStampError> {
        let template = template.ok_or(ValidationError::MissingTemplate)?;
        if fields.is_empty() {
            return Err(ValidationError::NoFields.into());
        }
        if rows.is_empty() {
            return Err(ValidationError::NoRows.into());
        }
        Ok(Self {
            template,
            fields,
            mapping,
            rows,
        })
    }

    pub fn template(&self) -> &Arc<Template> {
        &self.template
    }

    pub fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn mapping(&self) -> &ColumnMapping {
        &self.mapping
    }

    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }

    pub fn total_rows(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

impl Progress {
    /// Whole-number percentage as shown on a progress bar.
    pub fn percent(&self) -> u32 {
        let total = self.total.max(1) as f64;
        (self.current as f64 / total * 100.0).round() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Loading,
    Rendering { row: usize, total: usize },
    Packaging,
    Downloading,
    Failed(String),
}

/// Receives state transitions and per-row progress. Both default to no-ops.
pub trait BatchObserver {
    fn on_state(&mut self, _state: &BatchState) {}

    fn on_progress(&mut self, _progress: Progress) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl BatchObserver for NoopObserver {}

/// Adapts a progress closure into an observer.
pub struct ProgressFn<F>(pub F);

impl<F: FnMut(Progress)> BatchObserver for ProgressFn<F> {
    fn on_progress(&mut self, progress: Progress) {
        (self.0)(progress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFailure {
    pub row_index: usize,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub archive_name: String,
    pub archive: Vec<u8>,
    /// Entry names in archive order.
    pub entries: Vec<String>,
    /// Rows left out of the archive, in row order.
    pub skipped: Vec<RowFailure>,
    pub total_rows: usize,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub fallback_canvas_size: PixelSize,
    /// Date stamped into the archive name. `None` takes today's UTC date at
    /// packaging time.
    pub packaging_date: Option<NaiveDate>,
    pub max_archive_bytes: Option<u64>,
    pub events: Option<EventLog>,
    pub perf: Option<PerfLog>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            fallback_canvas_size: FALLBACK_CANVAS_SIZE,
            packaging_date: None,
            max_archive_bytes: None,
            events: None,
            perf: None,
        }
    }
}

/// `<first field's mapped value>.png`, or `certificate-<n>.png` (1-based) when
/// that value is missing or empty.
pub fn row_filename(
    fields: &[FieldDefinition],
    mapping: &ColumnMapping,
    row: &DataRow,
    row_index: usize,
) -> String {
    let value = fields
        .first()
        .map(|field| resolve_value(field, mapping, row, ResolveMode::Batch))
        .unwrap_or_default();
    if value.is_empty() {
        format!("certificate-{}.png", row_index + 1)
    } else {
        format!("{value}.png")
    }
}

pub fn archive_name(date: NaiveDate) -> String {
    format!("certificates-{}.zip", date.format("%Y-%m-%d"))
}

/// Renders and encodes one certificate for `row` on a fresh surface.
#[allow(clippy::too_many_arguments)]
pub(crate) fn render_certificate<F: SurfaceFactory>(
    factory: &F,
    renderer: &FieldRenderer,
    template: &Template,
    fields: &[FieldDefinition],
    values: &FieldValues,
    size: PixelSize,
    perf: Option<&PerfLog>,
    row: Option<usize>,
) -> Result<Vec<u8>, CertStampError> {
    let mut surface = factory.create(size)?;
    timed(perf, "row.render", row, || {
        renderer.render(&mut surface, template, fields, values)
    })?;
    timed(perf, "row.encode", row, || surface.encode_png())
}

/// Row-at-a-time batch. Each `step` renders exactly one row, so a driver can
/// yield, report progress or stop between rows.
pub struct BatchRun<'a, F: SurfaceFactory> {
    input: &'a BatchInput,
    factory: &'a F,
    renderer: &'a FieldRenderer,
    options: &'a BatchOptions,
    size: PixelSize,
    next_row: usize,
    names: EntryNames,
    entries: Vec<(String, Vec<u8>)>,
    skipped: Vec<RowFailure>,
}

impl<'a, F: SurfaceFactory> BatchRun<'a, F> {
    pub fn new(
        input: &'a BatchInput,
        factory: &'a F,
        renderer: &'a FieldRenderer,
        options: &'a BatchOptions,
    ) -> Self {
        let size = input.template().output_size(options.fallback_canvas_size);
        if let Some(events) = &options.events {
            events.event(
                "batch.start",
                json!({
                    "rows": input.total_rows(),
                    "fields": input.fields().len(),
                    "width": size.width,
                    "height": size.height,
                }),
            );
        }
        Self {
            input,
            factory,
            renderer,
            options,
            size,
            next_row: 0,
            names: EntryNames::new(),
            entries: Vec::with_capacity(input.total_rows()),
            skipped: Vec::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.input.total_rows()
    }

    pub fn completed(&self) -> usize {
        self.next_row
    }

    pub fn is_done(&self) -> bool {
        self.next_row >= self.total()
    }

    /// Index of the row the next `step` renders.
    pub fn next_row(&self) -> Option<usize> {
        (!self.is_done()).then_some(self.next_row)
    }

    /// Renders the next row. A row that fails is recorded as skipped and the
    /// run carries on.
    pub fn step(&mut self) -> Option<Progress> {
        let index = self.next_row()?;
        let row = &self.input.rows()[index];
        let values = FieldValues::resolve(
            self.input.fields(),
            self.input.mapping(),
            row,
            ResolveMode::Batch,
        );
        let rendered = render_certificate(
            self.factory,
            self.renderer,
            self.input.template(),
            self.input.fields(),
            &values,
            self.size,
            self.options.perf.as_ref(),
            Some(index),
        );
        match rendered {
            Ok(png) => {
                let wanted = row_filename(self.input.fields(), self.input.mapping(), row, index);
                let name = self.names.claim(&wanted);
                if let Some(events) = &self.options.events {
                    events.event(
                        "row.rendered",
                        json!({"row": index, "name": name, "bytes": png.len()}),
                    );
                    events.increment("rows.rendered", 1);
                }
                self.entries.push((name, png));
            }
            Err(err) => {
                log::warn!("row {} skipped: {err}", index + 1);
                if let Some(events) = &self.options.events {
                    events.event(
                        "row.skipped",
                        json!({"row": index, "reason": err.to_string()}),
                    );
                    events.increment("rows.skipped", 1);
                }
                self.skipped.push(RowFailure {
                    row_index: index,
                    reason: err.to_string(),
                });
            }
        }
        self.next_row += 1;
        Some(Progress {
            current: self.next_row,
            total: self.total(),
        })
    }

    /// Packs every rendered row into the archive.
    pub fn finish(self) -> Result<BatchOutput, CertStampError> {
        let total_rows = self.total();
        let date = self
            .options
            .packaging_date
            .unwrap_or_else(|| chrono::Utc::now().date_naive());
        let packaged = timed(self.options.perf.as_ref(), "batch.package", None, || {
            package(&self.entries, date, self.options.max_archive_bytes)
        });
        let events = self.options.events.as_ref();
        let archive = match packaged {
            Ok(archive) => archive,
            Err(err) => {
                if let Some(events) = events {
                    events.event("batch.failed", json!({"reason": err.to_string()}));
                    events.emit_summary("batch");
                    events.flush();
                }
                return Err(err);
            }
        };
        let archive_name = archive_name(date);
        if let Some(events) = events {
            events.event(
                "batch.packaged",
                json!({
                    "archive": archive_name,
                    "entries": self.entries.len(),
                    "skipped": self.skipped.len(),
                    "bytes": archive.len(),
                }),
            );
            events.emit_summary("batch");
            events.flush();
        }
        if let Some(perf) = &self.options.perf {
            perf.flush();
        }
        Ok(BatchOutput {
            archive_name,
            archive,
            entries: self.entries.into_iter().map(|(name, _)| name).collect(),
            skipped: self.skipped,
            total_rows,
        })
    }
}

/// Drives a whole batch on the calling thread: `Loading`, one `Rendering`
/// state and progress event per row, `Packaging`, and `Failed` if packaging
/// fails. `cancel` is checked between rows.
pub fn run_batch<F: SurfaceFactory>(
    input: &BatchInput,
    factory: &F,
    renderer: &FieldRenderer,
    options: &BatchOptions,
    observer: &mut dyn BatchObserver,
    cancel: Option<&AtomicBool>,
) -> Result<BatchOutput, CertStampError> {
    observer.on_state(&BatchState::Loading);
    let mut run = BatchRun::new(input, factory, renderer, options);
    while let Some(row) = run.next_row() {
        if cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            return Err(cancelled(&run, options));
        }
        observer.on_state(&BatchState::Rendering {
            row,
            total: run.total(),
        });
        if let Some(progress) = run.step() {
            observer.on_progress(progress);
        }
    }
    package_run(run, observer)
}

pub(crate) fn cancelled<F: SurfaceFactory>(
    run: &BatchRun<'_, F>,
    options: &BatchOptions,
) -> CertStampError {
    let (completed, total) = (run.completed(), run.total());
    if let Some(events) = &options.events {
        events.event("batch.cancelled", json!({"completed": completed, "total": total}));
        events.flush();
    }
    CertStampError::Cancelled { completed, total }
}

pub(crate) fn package_run<F: SurfaceFactory, O: BatchObserver + ?Sized>(
    run: BatchRun<'_, F>,
    observer: &mut O,
) -> Result<BatchOutput, CertStampError> {
    observer.on_state(&BatchState::Packaging);
    match run.finish() {
        Ok(output) => Ok(output),
        Err(err) => {
            observer.on_state(&BatchState::Failed(err.to_string()));
            Err(err)
        }
    }
}
