mod archive;
mod batch;
mod canvas;
mod debug;
mod error;
mod font;
mod geometry;
mod job;
mod model;
mod perf;
mod preview;
#[cfg(feature = "python")]
mod python;
mod render;
mod resolve;
mod session;
mod template;
mod types;

pub use archive::{EntryNames, ZipWriter, crc32, sanitize_entry_name};
pub use batch::{
    BatchInput, BatchObserver, BatchOptions, BatchOutput, BatchRun, BatchState, NoopObserver,
    Progress, ProgressFn, RowFailure, archive_name, row_filename, run_batch,
};
pub use canvas::{Canvas, PixmapCanvas, PixmapSurfaceFactory, SurfaceFactory, TextMeasurer};
pub use debug::EventLog;
pub use error::{CertStampError, ValidationError};
pub use font::{FontDescriptor, FontReadiness, FontReadinessSignal, FontRegistry};
pub use geometry::{
    DEFAULT_REFERENCE_WIDTH, FALLBACK_CANVAS_SIZE, FieldPlacement, MIN_FONT_SIZE, Normalizer,
    export_scale, field_position, output_font_size,
};
pub use job::{
    CancelHandle, ChannelObserver, JobEvent, decode_template, render_preview_async,
    run_batch_async,
};
pub use model::{
    ColumnMapping, DEFAULT_FIELD_COLOR, DEFAULT_FONT_FAMILY, DEFAULT_FONT_SIZE, DataRow,
    FieldDefinition,
};
pub use perf::PerfLog;
pub use preview::{PREVIEW_FILE_NAME, PreviewOutput, render_preview, validate_preview};
pub use render::{FieldRenderer, UnderlineGeometry};
pub use resolve::{FieldValues, ResolveMode, resolve_value};
pub use session::{DirectoryTarget, MemoryTarget, SaveTarget, Session};
pub use template::Template;
pub use types::{Color, PixelSize, Point};

use chrono::NaiveDate;
use std::path::PathBuf;
use std::sync::Arc;

/// Certificate rendering engine: shared fonts plus the settings every
/// preview and batch run uses.
#[derive(Debug, Clone)]
pub struct CertStamp {
    fonts: Arc<FontRegistry>,
    normalizer: Normalizer,
    fallback_canvas_size: PixelSize,
    max_archive_bytes: Option<u64>,
    packaging_date: Option<NaiveDate>,
    events: Option<EventLog>,
    perf: Option<PerfLog>,
    fonts_ready: Option<FontReadinessSignal>,
}

impl CertStamp {
    pub fn builder() -> CertStampBuilder {
        CertStampBuilder::new()
    }

    /// Fonts can still be registered here after the engine is built.
    pub fn fonts(&self) -> &Arc<FontRegistry> {
        &self.fonts
    }

    pub fn normalizer(&self) -> Normalizer {
        self.normalizer
    }

    pub fn surface_factory(&self) -> PixmapSurfaceFactory {
        PixmapSurfaceFactory::new(self.fonts.clone())
    }

    pub fn renderer(&self) -> FieldRenderer {
        FieldRenderer::new(self.normalizer).with_events(self.events.clone())
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            fallback_canvas_size: self.fallback_canvas_size,
            packaging_date: self.packaging_date,
            max_archive_bytes: self.max_archive_bytes,
            events: self.events.clone(),
            perf: self.perf.clone(),
        }
    }

    pub fn output_size(&self, template: &Template) -> PixelSize {
        template.output_size(self.fallback_canvas_size)
    }

    /// Placements for an editor surface of any size. Uses the same
    /// normalizer as export, so positions agree after scaling.
    pub fn layout_fields(
        &self,
        template: &Template,
        fields: &[FieldDefinition],
        surface: PixelSize,
    ) -> Vec<FieldPlacement> {
        let native_width = template.native_size().width;
        fields
            .iter()
            .map(|field| self.normalizer.place(field, surface, native_width))
            .collect()
    }

    pub async fn run_batch<O: BatchObserver + ?Sized>(
        &self,
        input: &BatchInput,
        observer: &mut O,
        cancel: Option<&CancelHandle>,
    ) -> Result<BatchOutput, CertStampError> {
        run_batch_async(
            input,
            &self.surface_factory(),
            &self.renderer(),
            &self.batch_options(),
            self.fonts_ready.clone(),
            observer,
            cancel,
        )
        .await
    }

    /// Same as [`CertStamp::run_batch`] on the calling thread. Does not wait
    /// for font readiness.
    pub fn run_batch_blocking(
        &self,
        input: &BatchInput,
        observer: &mut dyn BatchObserver,
        cancel: Option<&CancelHandle>,
    ) -> Result<BatchOutput, CertStampError> {
        self.warn_if_fonts_pending();
        run_batch(
            input,
            &self.surface_factory(),
            &self.renderer(),
            &self.batch_options(),
            observer,
            cancel.map(CancelHandle::flag),
        )
    }

    pub async fn preview(
        &self,
        template: &Template,
        fields: &[FieldDefinition],
        mapping: &ColumnMapping,
        rows: &[DataRow],
    ) -> Result<PreviewOutput, CertStampError> {
        render_preview_async(
            &self.surface_factory(),
            &self.renderer(),
            template,
            fields,
            mapping,
            rows,
            &self.batch_options(),
            self.fonts_ready.clone(),
        )
        .await
    }

    pub fn preview_blocking(
        &self,
        template: &Template,
        fields: &[FieldDefinition],
        mapping: &ColumnMapping,
        rows: &[DataRow],
    ) -> Result<PreviewOutput, CertStampError> {
        self.warn_if_fonts_pending();
        render_preview(
            &self.surface_factory(),
            &self.renderer(),
            template,
            fields,
            mapping,
            rows,
            self.fallback_canvas_size,
            self.perf.as_ref(),
        )
    }

    fn warn_if_fonts_pending(&self) {
        if self.fonts_ready.as_ref().is_some_and(|s| !s.is_ready()) {
            log::warn!("rendering before fonts signalled ready; fallback faces may be used");
        }
    }
}

pub struct CertStampBuilder {
    font_dirs: Vec<PathBuf>,
    font_files: Vec<PathBuf>,
    font_bytes: Vec<(Vec<u8>, Option<String>)>,
    shape_text: bool,
    use_system_fonts: bool,
    fallback_canvas_size: PixelSize,
    reference_width_fallback: u32,
    max_archive_bytes: Option<u64>,
    event_log_path: Option<PathBuf>,
    event_log: Option<EventLog>,
    perf_path: Option<PathBuf>,
    packaging_date: Option<NaiveDate>,
    fonts_ready: Option<FontReadinessSignal>,
}

impl CertStampBuilder {
    pub fn new() -> Self {
        Self {
            font_dirs: Vec::new(),
            font_files: Vec::new(),
            font_bytes: Vec::new(),
            shape_text: true,
            use_system_fonts: true,
            fallback_canvas_size: FALLBACK_CANVAS_SIZE,
            reference_width_fallback: DEFAULT_REFERENCE_WIDTH,
            max_archive_bytes: None,
            event_log_path: None,
            event_log: None,
            perf_path: None,
            packaging_date: None,
            fonts_ready: None,
        }
    }

    pub fn register_font_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_dirs.push(path.into());
        self
    }

    pub fn register_font_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_files.push(path.into());
        self
    }

    pub fn register_font_bytes(mut self, data: Vec<u8>, name: Option<&str>) -> Self {
        self.font_bytes.push((data, name.map(str::to_string)));
        self
    }

    // rustybuzz shaping (kerning, ligatures, RTL). Off falls back to cmap
    // lookups with plain advances.
    pub fn shape_text(mut self, enabled: bool) -> Self {
        self.shape_text = enabled;
        self
    }

    // Search platform font directories (and CERTSTAMP_FONT_DIR) for families
    // that were not registered explicitly.
    pub fn use_system_fonts(mut self, enabled: bool) -> Self {
        self.use_system_fonts = enabled;
        self
    }

    pub fn fallback_canvas_size(mut self, size: PixelSize) -> Self {
        self.fallback_canvas_size = size;
        self
    }

    pub fn reference_width_fallback(mut self, width: u32) -> Self {
        self.reference_width_fallback = width;
        self
    }

    pub fn max_archive_bytes(mut self, limit: Option<u64>) -> Self {
        self.max_archive_bytes = limit;
        self
    }

    // JSONL batch events (row.rendered, row.skipped, batch.summary, ...).
    pub fn event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_log_path = Some(path.into());
        self
    }

    pub fn event_sink(mut self, log: EventLog) -> Self {
        self.event_log = Some(log);
        self
    }

    // JSONL span timings plus a `<stem>_hot.log` summary.
    pub fn perf_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.perf_path = Some(path.into());
        self
    }

    /// Fixes the archive date stamp instead of using today's UTC date.
    pub fn packaging_date(mut self, date: NaiveDate) -> Self {
        self.packaging_date = Some(date);
        self
    }

    /// Batches and previews wait on this once before drawing.
    pub fn font_readiness(mut self, signal: FontReadinessSignal) -> Self {
        self.fonts_ready = Some(signal);
        self
    }

    pub fn build(self) -> Result<CertStamp, CertStampError> {
        if self.fallback_canvas_size.is_empty() {
            return Err(CertStampError::InvalidConfiguration(
                "fallback_canvas_size must be non-zero in both dimensions".to_string(),
            ));
        }
        if self.reference_width_fallback == 0 {
            return Err(CertStampError::InvalidConfiguration(
                "reference_width_fallback must be > 0".to_string(),
            ));
        }
        if self.max_archive_bytes == Some(0) {
            return Err(CertStampError::InvalidConfiguration(
                "max_archive_bytes must be > 0 when set".to_string(),
            ));
        }

        let mut registry = FontRegistry::new();
        registry.set_shape_text(self.shape_text);
        registry.set_use_system_fonts(self.use_system_fonts);
        for dir in &self.font_dirs {
            let count = registry.register_dir(dir);
            log::debug!("registered {count} fonts from {}", dir.display());
        }
        for file in &self.font_files {
            registry.register_file(file)?;
        }
        for (data, name) in self.font_bytes {
            registry.register_bytes(data, name.as_deref())?;
        }

        let events = match (self.event_log, self.event_log_path) {
            (Some(log), _) => Some(log),
            (None, Some(path)) => Some(EventLog::new(path)?),
            (None, None) => None,
        };
        let perf = match self.perf_path {
            Some(path) => Some(PerfLog::new(path)?),
            None => None,
        };

        Ok(CertStamp {
            fonts: Arc::new(registry),
            normalizer: Normalizer::new(self.reference_width_fallback),
            fallback_canvas_size: self.fallback_canvas_size,
            max_archive_bytes: self.max_archive_bytes,
            packaging_date: self.packaging_date,
            events,
            perf,
            fonts_ready: self.fonts_ready,
        })
    }
}

impl Default for CertStampBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::read_entries;
    use crate::debug::tests::SharedBuf;
    use crate::template::tests::solid_template;
    use sha2::{Digest, Sha256};

    fn engine() -> CertStamp {
        CertStamp::builder()
            .use_system_fonts(false)
            .packaging_date(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
            .build()
            .unwrap()
    }

    fn digest(bytes: &[u8]) -> Vec<u8> {
        Sha256::digest(bytes).to_vec()
    }

    fn underlined_input(template: Template) -> BatchInput {
        BatchInput::new(
            Some(Arc::new(template)),
            vec![FieldDefinition {
                underline: true,
                font_size: 20.0,
                ..FieldDefinition::named("1", "Name")
            }],
            ColumnMapping::new().with("Name", "name"),
            vec![
                DataRow::from_pairs([("name", "Ada")]),
                DataRow::from_pairs([("name", "Grace")]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn builder_rejects_degenerate_settings() {
        let err = CertStamp::builder()
            .reference_width_fallback(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, CertStampError::InvalidConfiguration(_)));
        let err = CertStamp::builder()
            .fallback_canvas_size(PixelSize::new(0, 10))
            .build()
            .unwrap_err();
        assert!(matches!(err, CertStampError::InvalidConfiguration(_)));
        assert!(
            CertStamp::builder()
                .register_font_bytes(vec![0, 1, 2], Some("junk"))
                .build()
                .is_err()
        );
    }

    #[test]
    fn repeated_renders_are_pixel_identical() {
        let engine = engine();
        let input = underlined_input(solid_template(200, 100, [250, 240, 230, 255]));
        let first = engine
            .run_batch_blocking(&input, &mut NoopObserver, None)
            .unwrap();
        let second = engine
            .run_batch_blocking(&input, &mut NoopObserver, None)
            .unwrap();
        assert_eq!(digest(&first.archive), digest(&second.archive));
        assert_eq!(first.archive_name, "certificates-2025-06-01.zip");
    }

    fn fixture_engine() -> (CertStamp, String) {
        let bytes = std::fs::read(crate::font::tests::fixture_font_path()).unwrap();
        let engine = CertStamp::builder()
            .use_system_fonts(false)
            .register_font_bytes(bytes, Some("DejaVuSans.ttf"))
            .packaging_date(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
            .build()
            .unwrap();
        (engine, "DejaVu Sans".to_string())
    }

    /// First archive entry decoded, with every pixel darker than mid grey
    /// marked as ink.
    fn first_entry_ink(engine: &CertStamp, input: &BatchInput) -> Vec<Vec<bool>> {
        let output = engine
            .run_batch_blocking(input, &mut NoopObserver, None)
            .unwrap();
        let entries = read_entries(&output.archive);
        let image = image::load_from_memory(&entries[0].1).unwrap().to_rgba8();
        assert_eq!(image.dimensions(), (400, 200));
        (0..image.height())
            .map(|y| {
                (0..image.width())
                    .map(|x| image.get_pixel(x, y).0[0] < 128)
                    .collect()
            })
            .collect()
    }

    fn bounds(ink: &[Vec<bool>]) -> Option<(usize, usize, usize, usize)> {
        let mut out: Option<(usize, usize, usize, usize)> = None;
        for (y, row) in ink.iter().enumerate() {
            for (x, _) in row.iter().enumerate().filter(|(_, on)| **on) {
                out = Some(match out {
                    None => (x, y, x, y),
                    Some((l, t, r, b)) => (l.min(x), t.min(y), r.max(x), b.max(y)),
                });
            }
        }
        out
    }

    fn hhhh_input(family: &str, underline: bool) -> BatchInput {
        BatchInput::new(
            Some(Arc::new(solid_template(400, 200, [255, 255, 255, 255]))),
            vec![FieldDefinition {
                underline,
                font_size: 48.0,
                font_family: Some(family.to_string()),
                ..FieldDefinition::named("1", "Name")
            }],
            ColumnMapping::new().with("Name", "name"),
            vec![DataRow::from_pairs([("name", "HHHH")])],
        )
        .unwrap()
    }

    #[test]
    fn export_centers_text_and_underlines_its_measured_width() {
        let (engine, family) = fixture_engine();
        let plain = first_entry_ink(&engine, &hhhh_input(&family, false));
        let underlined = first_entry_ink(&engine, &hhhh_input(&family, true));

        let (left, top, right, bottom) = bounds(&plain).unwrap();
        let center_x = (left + right) as f32 / 2.0;
        let center_y = (top + bottom) as f32 / 2.0;
        assert!((center_x - 200.0).abs() <= 2.0, "ink x {left}..{right}");
        assert!((center_y - 100.0).abs() <= 3.0, "ink y {top}..{bottom}");

        let line: Vec<Vec<bool>> = underlined
            .iter()
            .zip(&plain)
            .map(|(u, p)| u.iter().zip(p).map(|(u, p)| *u && !*p).collect())
            .collect();
        let (l_left, l_top, l_right, l_bottom) = bounds(&line).unwrap();

        // 48px: the line sits at y = 100 + 16.8 and is 3px thick.
        assert!(l_top >= 114 && l_bottom <= 119, "line y {l_top}..{l_bottom}");
        assert!(l_left <= left && l_right >= right);
        let font = FontDescriptor::for_field(&hhhh_input(&family, true).fields()[0], 48.0);
        let measured = engine.fonts().measure_text_width(&font, "HHHH");
        let line_width = (l_right - l_left + 1) as f32;
        assert!((line_width - measured).abs() <= 2.0, "line {line_width} advance {measured}");
    }

    #[test]
    fn missing_face_draws_neither_text_nor_underline() {
        let engine = engine();
        let input = underlined_input(solid_template(200, 100, [255, 255, 255, 255]));
        let output = engine
            .run_batch_blocking(&input, &mut NoopObserver, None)
            .unwrap();
        let entries = read_entries(&output.archive);
        let image = image::load_from_memory(&entries[0].1).unwrap().to_rgba8();
        assert_eq!(image.dimensions(), (200, 100));
        assert!(image.pixels().all(|px| px.0 == [255, 255, 255, 255]));
    }

    #[test]
    fn editor_layout_matches_export_after_scaling() {
        let engine = engine();
        let template = solid_template(1600, 1000, [255, 255, 255, 255]);
        let fields = vec![FieldDefinition {
            x: 25.0,
            y: 75.0,
            font_size: 48.0,
            ..FieldDefinition::named("1", "Name")
        }];
        let export = engine.layout_fields(&template, &fields, engine.output_size(&template));
        let editor = engine.layout_fields(&template, &fields, PixelSize::new(800, 500));
        assert_eq!(export[0].position, Point::new(400.0, 750.0));
        assert_eq!(editor[0].position, Point::new(200.0, 375.0));
        assert_eq!(export[0].font_size, 48.0);
        assert_eq!(editor[0].font_size, 24.0);
    }

    #[test]
    fn event_sink_receives_batch_events() {
        let buf = SharedBuf::default();
        let engine = CertStamp::builder()
            .use_system_fonts(false)
            .event_sink(EventLog::to_writer(buf.clone()))
            .build()
            .unwrap();
        let input = underlined_input(solid_template(50, 40, [255, 255, 255, 255]));
        engine
            .run_batch_blocking(&input, &mut NoopObserver, None)
            .unwrap();
        let kinds: Vec<String> = buf
            .lines()
            .iter()
            .map(|l| l["type"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds.first().map(String::as_str), Some("batch.start"));
        assert_eq!(kinds.last().map(String::as_str), Some("batch.summary"));
        assert_eq!(kinds.iter().filter(|k| *k == "row.rendered").count(), 2);
    }

    #[tokio::test]
    async fn async_preview_waits_for_fonts() {
        let (readiness, signal) = FontReadinessSignal::pending();
        let engine = CertStamp::builder()
            .use_system_fonts(false)
            .font_readiness(signal)
            .build()
            .unwrap();
        let template = solid_template(30, 20, [255, 255, 255, 255]);
        let fields = vec![FieldDefinition::named("1", "Name")];
        readiness.mark_ready();
        let preview = engine
            .preview(&template, &fields, &ColumnMapping::new(), &[])
            .await
            .unwrap();
        assert_eq!(preview.file_name, PREVIEW_FILE_NAME);
        let decoded = image::load_from_memory(&preview.png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (30, 20));
    }
}
