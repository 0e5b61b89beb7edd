//! Cooperative async driver.
//!
//! Order of work: template decode, one font-readiness wait, then
//! `(render row, encode row, yield)` per row, then packaging. Rows never run
//! in parallel and a cancel request is only honoured between rows.

use crate::batch::{
    BatchInput, BatchObserver, BatchOptions, BatchOutput, BatchRun, BatchState, Progress,
    cancelled, package_run,
};
use crate::canvas::SurfaceFactory;
use crate::error::CertStampError;
use crate::font::FontReadinessSignal;
use crate::model::{ColumnMapping, DataRow, FieldDefinition};
use crate::preview::{PreviewOutput, render_preview};
use crate::render::FieldRenderer;
use crate::template::Template;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Shared stop flag. Cloning hands out another handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn flag(&self) -> &AtomicBool {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    State(BatchState),
    Progress(Progress),
}

/// Forwards observer callbacks onto a channel so a UI task can follow a batch
/// running elsewhere. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl BatchObserver for ChannelObserver {
    fn on_state(&mut self, state: &BatchState) {
        let _ = self.tx.send(JobEvent::State(state.clone()));
    }

    fn on_progress(&mut self, progress: Progress) {
        let _ = self.tx.send(JobEvent::Progress(progress));
    }
}

/// Decodes template bytes on the blocking pool so the caller's task stays
/// responsive.
pub async fn decode_template(bytes: Vec<u8>) -> Result<Arc<Template>, CertStampError> {
    let decoded = tokio::task::spawn_blocking(move || Template::from_bytes(&bytes))
        .await
        .map_err(|err| CertStampError::Decode(format!("decode task failed: {err}")))??;
    Ok(Arc::new(decoded))
}

pub async fn run_batch_async<F, O>(
    input: &BatchInput,
    factory: &F,
    renderer: &FieldRenderer,
    options: &BatchOptions,
    fonts_ready: Option<FontReadinessSignal>,
    observer: &mut O,
    cancel: Option<&CancelHandle>,
) -> Result<BatchOutput, CertStampError>
where
    F: SurfaceFactory,
    O: BatchObserver + ?Sized,
{
    observer.on_state(&BatchState::Loading);
    if let Some(signal) = fonts_ready {
        signal.wait().await;
    }

    let mut run = BatchRun::new(input, factory, renderer, options);
    while let Some(row) = run.next_row() {
        if cancel.is_some_and(CancelHandle::is_cancelled) {
            return Err(cancelled(&run, options));
        }
        observer.on_state(&BatchState::Rendering {
            row,
            total: run.total(),
        });
        if let Some(progress) = run.step() {
            observer.on_progress(progress);
        }
        tokio::task::yield_now().await;
    }
    package_run(run, observer)
}

#[allow(clippy::too_many_arguments)]
pub async fn render_preview_async<F: SurfaceFactory>(
    factory: &F,
    renderer: &FieldRenderer,
    template: &Template,
    fields: &[FieldDefinition],
    mapping: &ColumnMapping,
    rows: &[DataRow],
    options: &BatchOptions,
    fonts_ready: Option<FontReadinessSignal>,
) -> Result<PreviewOutput, CertStampError> {
    if let Some(signal) = fonts_ready {
        signal.wait().await;
    }
    render_preview(
        factory,
        renderer,
        template,
        fields,
        mapping,
        rows,
        options.fallback_canvas_size,
        options.perf.as_ref(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::{Recorder, fixed_options, scenario_input};
    use crate::canvas::recording::RecordingFactory;
    use crate::template::tests::png_bytes;
    use crate::types::PixelSize;

    #[tokio::test]
    async fn async_batch_matches_scenario() {
        let input = scenario_input();
        let mut recorder = Recorder::default();
        let output = run_batch_async(
            &input,
            &RecordingFactory::default(),
            &FieldRenderer::default(),
            &fixed_options(),
            None,
            &mut recorder,
            None,
        )
        .await
        .unwrap();
        assert_eq!(output.entries, ["Ada.png", "Bob.png", "certificate-3.png"]);
        assert_eq!(recorder.progress.last(), Some(&Progress { current: 3, total: 3 }));
    }

    #[tokio::test]
    async fn waits_for_fonts_before_first_row() {
        let input = scenario_input();
        let factory = Arc::new(RecordingFactory::default());
        let (readiness, signal) = FontReadinessSignal::pending();
        let (mut observer, mut events) = ChannelObserver::channel();

        let task_factory = factory.clone();
        let task = tokio::spawn(async move {
            run_batch_async(
                &input,
                task_factory.as_ref(),
                &FieldRenderer::default(),
                &fixed_options(),
                Some(signal),
                &mut observer,
                None,
            )
            .await
        });

        assert_eq!(events.recv().await, Some(JobEvent::State(BatchState::Loading)));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(factory.created(), 0);

        readiness.mark_ready();
        let output = task.await.unwrap().unwrap();
        assert_eq!(output.entries.len(), 3);
        assert_eq!(factory.created(), 3);

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let JobEvent::Progress(p) = event {
                progress.push(p.current);
            }
        }
        assert_eq!(progress, [1, 2, 3]);
    }

    #[tokio::test]
    async fn cancel_between_rows_returns_cancelled() {
        let input = scenario_input();
        let cancel = CancelHandle::new();
        struct CancelAfterFirst(CancelHandle);
        impl BatchObserver for CancelAfterFirst {
            fn on_progress(&mut self, progress: Progress) {
                if progress.current == 1 {
                    self.0.cancel();
                }
            }
        }
        let err = run_batch_async(
            &input,
            &RecordingFactory::default(),
            &FieldRenderer::default(),
            &fixed_options(),
            None,
            &mut CancelAfterFirst(cancel.clone()),
            Some(&cancel),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CertStampError::Cancelled { completed: 1, total: 3 }));
        assert!(err.is_user_facing());
    }

    #[tokio::test]
    async fn template_decodes_off_task() {
        let template = decode_template(png_bytes(12, 8, [1, 2, 3, 255])).await.unwrap();
        assert_eq!(template.native_size(), PixelSize::new(12, 8));
        let err = decode_template(b"nope".to_vec()).await.unwrap_err();
        assert!(matches!(err, CertStampError::Decode(_)));
    }
}
