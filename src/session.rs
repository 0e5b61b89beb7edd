use crate::CertStamp;
use crate::batch::{BatchInput, BatchObserver, BatchOutput, BatchState, Progress};
use crate::error::{CertStampError, ValidationError};
use crate::job::CancelHandle;
use crate::model::{ColumnMapping, DataRow, FieldDefinition};
use crate::preview::{PreviewOutput, validate_preview};
use crate::template::Template;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where finished files go: a directory, an in-memory list, or whatever a
/// host uses for its download action.
pub trait SaveTarget {
    fn save(&mut self, file_name: &str, bytes: &[u8]) -> Result<(), CertStampError>;
}

#[derive(Debug, Clone)]
pub struct DirectoryTarget {
    dir: PathBuf,
}

impl DirectoryTarget {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SaveTarget for DirectoryTarget {
    fn save(&mut self, file_name: &str, bytes: &[u8]) -> Result<(), CertStampError> {
        let path = self.dir.join(file_name);
        fs::create_dir_all(&self.dir)
            .and_then(|_| fs::write(&path, bytes))
            .map_err(|err| CertStampError::Save(format!("{}: {err}", path.display())))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTarget {
    pub files: Vec<(String, Vec<u8>)>,
}

impl SaveTarget for MemoryTarget {
    fn save(&mut self, file_name: &str, bytes: &[u8]) -> Result<(), CertStampError> {
        self.files.push((file_name.to_string(), bytes.to_vec()));
        Ok(())
    }
}

/// The inputs a user builds up across the upload, design and mapping steps.
///
/// A completed download clears all of them. Validation failures, packaging
/// failures, save failures and cancellation leave them untouched.
///
/// After `download_all` returns the state is settled: `Idle` on success, on
/// validation failure and on cancellation, `Failed` after a packaging or
/// save failure.
#[derive(Debug, Default)]
pub struct Session {
    template: Option<Arc<Template>>,
    fields: Vec<FieldDefinition>,
    mapping: ColumnMapping,
    rows: Vec<DataRow>,
    state: Option<BatchState>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any earlier template.
    pub fn set_template(&mut self, template: impl Into<Arc<Template>>) {
        self.template = Some(template.into());
    }

    pub fn set_fields(&mut self, fields: Vec<FieldDefinition>) {
        self.fields = fields;
    }

    pub fn fields_mut(&mut self) -> &mut Vec<FieldDefinition> {
        &mut self.fields
    }

    pub fn set_mapping(&mut self, mapping: ColumnMapping) {
        self.mapping = mapping;
    }

    pub fn set_rows(&mut self, rows: Vec<DataRow>) {
        self.rows = rows;
    }

    pub fn template(&self) -> Option<&Arc<Template>> {
        self.template.as_ref()
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

    pub fn state(&self) -> BatchState {
        self.state.clone().unwrap_or(BatchState::Idle)
    }

    pub fn is_empty(&self) -> bool {
        self.template.is_none()
            && self.fields.is_empty()
            && self.mapping.is_empty()
            && self.rows.is_empty()
    }

    pub fn batch_input(&self) -> Result<BatchInput, CertStampError> {
        BatchInput::new(
            self.template.clone(),
            self.fields.clone(),
            self.mapping.clone(),
            self.rows.clone(),
        )
    }

    pub fn reset(&mut self) {
        self.template = None;
        self.fields.clear();
        self.mapping = ColumnMapping::new();
        self.rows.clear();
        self.state = None;
    }

    /// Renders every row, saves `certificates-<date>.zip` through `target`
    /// and then clears the session.
    pub async fn download_all<O: BatchObserver + ?Sized>(
        &mut self,
        engine: &CertStamp,
        target: &mut dyn SaveTarget,
        observer: &mut O,
        cancel: Option<&CancelHandle>,
    ) -> Result<BatchOutput, CertStampError> {
        let input = self.batch_input()?;
        let mut tracked = Tracked {
            inner: observer,
            last: None,
        };
        let result = engine.run_batch(&input, &mut tracked, cancel).await;
        self.state = tracked.last.take();
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if matches!(err, CertStampError::Cancelled { .. }) {
                    tracked.on_state(&BatchState::Idle);
                    self.state = tracked.last.take();
                }
                return Err(err);
            }
        };

        tracked.on_state(&BatchState::Downloading);
        self.state = tracked.last.take();
        if let Err(err) = target.save(&output.archive_name, &output.archive) {
            tracked.on_state(&BatchState::Failed(err.to_string()));
            self.state = tracked.last.take();
            return Err(err);
        }

        self.reset();
        tracked.on_state(&BatchState::Idle);
        Ok(output)
    }

    /// Saves `certificate-preview.png`. Session inputs stay as they are.
    pub async fn download_preview(
        &self,
        engine: &CertStamp,
        target: &mut dyn SaveTarget,
    ) -> Result<PreviewOutput, CertStampError> {
        validate_preview(self.template.as_deref(), &self.fields)?;
        let Some(template) = self.template.as_ref() else {
            return Err(ValidationError::MissingTemplate.into());
        };
        let preview = engine
            .preview(template, &self.fields, &self.mapping, &self.rows)
            .await?;
        target.save(&preview.file_name, &preview.png)?;
        Ok(preview)
    }
}

struct Tracked<'a, O: BatchObserver + ?Sized> {
    inner: &'a mut O,
    last: Option<BatchState>,
}

impl<O: BatchObserver + ?Sized> BatchObserver for Tracked<'_, O> {
    fn on_state(&mut self, state: &BatchState) {
        self.last = Some(state.clone());
        self.inner.on_state(state);
    }

    fn on_progress(&mut self, progress: Progress) {
        self.inner.on_progress(progress);
    }
}
