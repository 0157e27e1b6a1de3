//! The OCR pipeline: validation, queueing, invocation and packaging for one
//! request at a time, with every resource released on every path out.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::Instant};
use uuid::Uuid;

use crate::{
    artifacts::{ArtifactScope, ArtifactStore},
    async_utils::{CancelHandle, CancelSignal, cancel_pair},
    gate::{ConcurrencyGate, Slot},
    invoker::{InvocationOutcome, InvocationRequest, OcrInvoker, OutcomeClass, TextLayerMode},
    language::{Language, canonicalize},
    pdf,
    prelude::*,
};

use self::{
    job::{JobState, RecognitionJob},
    request::{AlreadyHasTextPolicy, RecognitionRequest},
};

mod error;
pub mod job;
pub mod request;

pub use self::error::{FailureKind, PipelineError};

/// The most time we give `pdfinfo` to count pages. Never extends past the
/// job's deadline.
const PAGE_COUNT_TIMEOUT: Duration = Duration::from_secs(10);

/// Fixed settings for an [`Orchestrator`].
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Overall limit per job, including time spent waiting for a worker.
    pub job_timeout: Duration,
    /// Largest document we accept.
    pub max_document_bytes: usize,
    /// Languages we have OCR models for.
    pub supported_languages: Vec<Language>,
    /// Languages used when a request names none.
    pub default_languages: Vec<Language>,
    /// What to do with documents that already have text.
    pub already_has_text: AlreadyHasTextPolicy,
    /// Report page counts for returned documents.
    pub count_pages: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(300),
            max_document_bytes: 12 * 1024 * 1024,
            supported_languages: vec![Language::English, Language::Swedish],
            default_languages: vec![Language::English],
            already_has_text: AlreadyHasTextPolicy::default(),
            count_pages: true,
        }
    }
}

/// A successfully processed document.
#[derive(Clone, Debug)]
pub struct RecognizedDocument {
    /// The PDF to return.
    pub bytes: Vec<u8>,
    /// False if we passed the input through because it already had text.
    pub ocr_applied: bool,
    /// Page count, if we could determine it.
    pub page_count: Option<usize>,
}

/// Everything we know about a finished job.
#[derive(Debug)]
pub struct RecognitionReport {
    pub job_id: Uuid,
    /// States the job went through, ending with [`JobState::Released`].
    pub states: Vec<JobState>,
    pub elapsed: Duration,
    pub result: Result<RecognizedDocument, PipelineError>,
}

/// A submitted job. Dropping this (or the future returned by
/// [`JobHandle::wait`]) cancels the job.
#[derive(Debug)]
pub struct JobHandle {
    job_id: Uuid,
    cancel: CancelHandle,
    task: JoinHandle<RecognitionReport>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<RecognitionReport> {
        // Held until the task finishes, so that dropping this future mid-wait
        // cancels the job.
        let _cancel = self.cancel;
        self.task.await.context("recognition job panicked")
    }

    /// Ask the job to stop, and wait for it to clean up.
    pub async fn cancel(self) -> Result<RecognitionReport> {
        self.cancel.cancel();
        self.task.await.context("recognition job panicked")
    }
}

/// Runs recognition jobs.
pub struct Orchestrator {
    gate: ConcurrencyGate,
    store: ArtifactStore,
    invoker: Arc<dyn OcrInvoker>,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        gate: ConcurrencyGate,
        store: ArtifactStore,
        invoker: Arc<dyn OcrInvoker>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            gate,
            store,
            invoker,
            settings,
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Start a job on its own task.
    pub fn submit(self: &Arc<Self>, request: RecognitionRequest) -> JobHandle {
        let job = RecognitionJob::new(self.settings.job_timeout);
        let job_id = job.id;
        let (cancel, signal) = cancel_pair();
        let this = self.clone();
        let task = tokio::spawn(async move { this.run_job(job, request, signal).await });
        JobHandle {
            job_id,
            cancel,
            task,
        }
    }

    /// Run a job on the current task.
    pub async fn run(
        &self,
        request: RecognitionRequest,
        cancel: CancelSignal,
    ) -> RecognitionReport {
        let job = RecognitionJob::new(self.settings.job_timeout);
        self.run_job(job, request, cancel).await
    }

    #[instrument(level = "info", name = "job", skip_all, fields(job_id = %job.id))]
    async fn run_job(
        &self,
        mut job: RecognitionJob,
        request: RecognitionRequest,
        mut cancel: CancelSignal,
    ) -> RecognitionReport {
        let result = self.drive(&mut job, request, &mut cancel).await;

        // `drive` has dropped its slot and scope by now.
        let terminal = match &result {
            Ok(_) => JobState::Succeeded,
            Err(err) => match err.kind {
                FailureKind::QueueTimeout | FailureKind::Timeout => JobState::TimedOut,
                FailureKind::Cancelled => JobState::Cancelled,
                _ => JobState::Failed,
            },
        };
        job.transition(terminal);
        job.transition(JobState::Released);

        let elapsed = job.elapsed();
        match &result {
            Ok(doc) => info!(
                ?elapsed,
                ocr_applied = doc.ocr_applied,
                pages = ?doc.page_count,
                "Job succeeded"
            ),
            Err(err) if err.kind == FailureKind::Internal => {
                error!(?elapsed, kind = %err.kind, "Job failed: {}", err.detail)
            }
            Err(err) => warn!(?elapsed, kind = %err.kind, "Job failed: {}", err.detail),
        }

        RecognitionReport {
            job_id: job.id,
            states: job.history().to_vec(),
            elapsed,
            result,
        }
    }

    /// Take a job from `Received` to just before its terminal state.
    async fn drive(
        &self,
        job: &mut RecognitionJob,
        mut request: RecognitionRequest,
        cancel: &mut CancelSignal,
    ) -> Result<RecognizedDocument, PipelineError> {
        job.transition(JobState::Validating);
        let languages = self.validate(&request)?;
        let policy = request
            .already_has_text
            .unwrap_or(self.settings.already_has_text);
        let mode = if request.skip_text {
            TextLayerMode::SkipText
        } else if policy == AlreadyHasTextPolicy::Reprocess {
            TextLayerMode::ForceOcr
        } else {
            TextLayerMode::Standard
        };

        job.transition(JobState::AwaitingSlot);
        let mut slot = self.wait_for_slot(job.deadline, cancel).await?;
        job.transition(JobState::Running);

        let mut scope = match self.store.acquire(job.id, &request.document).await {
            Ok(scope) => scope,
            Err(err) => {
                slot.release();
                return Err(err);
            }
        };
        let invocation = InvocationRequest {
            input: scope.input().to_owned(),
            staging_output: scope.staging_output().to_owned(),
            languages,
            mode,
        };
        let outcome = self.invoker.invoke(invocation, job.deadline, cancel).await;
        slot.release();

        let result = async {
            let ocr_applied = self.interpret(outcome, &scope, policy).await?;
            let (bytes, counted) = if ocr_applied {
                let bytes = scope
                    .read_output()
                    .await
                    .map_err(|err| PipelineError::internal(&err))?;
                (bytes, scope.output())
            } else {
                (std::mem::take(&mut request.document.bytes), scope.input())
            };
            let page_count = self.count_pages(counted, job.deadline).await;
            Ok::<_, PipelineError>(RecognizedDocument {
                bytes,
                ocr_applied,
                page_count,
            })
        }
        .await;
        scope.release();
        result
    }

    /// Check everything we can before spending a slot. Returns the
    /// canonical language list to use.
    fn validate(&self, request: &RecognitionRequest) -> Result<Vec<Language>, PipelineError> {
        let document = &request.document;
        if document.len() > self.settings.max_document_bytes {
            return Err(PipelineError::payload_too_large(
                document.len(),
                self.settings.max_document_bytes,
            ));
        }
        if document.is_empty() {
            return Err(PipelineError::invalid_input("document is empty"));
        }
        if !document.has_acceptable_content_type() {
            return Err(PipelineError::invalid_input(format!(
                "content type {:?} is not a PDF",
                document.content_type.as_deref().unwrap_or_default()
            )));
        }
        if !document.has_plausible_file_name() {
            return Err(PipelineError::invalid_input(format!(
                "file name {:?} does not look like a PDF",
                document.file_name.as_deref().unwrap_or_default()
            )));
        }
        if !pdf::is_pdf(&document.bytes) {
            return Err(PipelineError::invalid_input("document is not a PDF"));
        }

        let mut languages = if request.languages.is_empty() {
            self.settings.default_languages.clone()
        } else {
            request.languages.clone()
        };
        canonicalize(&mut languages);
        if let Some(language) = languages
            .iter()
            .find(|language| !self.settings.supported_languages.contains(language))
        {
            return Err(PipelineError::invalid_input(format!(
                "language {} is not supported",
                language
            )));
        }
        Ok(languages)
    }

    /// Wait for a worker, until the job's deadline or cancellation.
    async fn wait_for_slot(
        &self,
        deadline: Instant,
        cancel: &mut CancelSignal,
    ) -> Result<Slot, PipelineError> {
        trace!(available = self.gate.available(), "Waiting for a worker");
        tokio::select! {
            acquired = tokio::time::timeout_at(deadline, self.gate.acquire()) => match acquired {
                Ok(Ok(slot)) => Ok(slot),
                Ok(Err(err)) => Err(PipelineError::internal(&err)),
                Err(_) => Err(PipelineError::new(
                    FailureKind::QueueTimeout,
                    format!(
                        "no OCR worker became free within {:?}",
                        self.settings.job_timeout
                    ),
                )),
            },
            _ = cancel.cancelled() => Err(PipelineError::new(
                FailureKind::Cancelled,
                "cancelled while waiting for an OCR worker",
            )),
        }
    }

    /// Decide what an invocation means. Returns whether OCR output is
    /// available, or `false` if the input should be passed through.
    async fn interpret(
        &self,
        outcome: Result<InvocationOutcome>,
        scope: &ArtifactScope,
        policy: AlreadyHasTextPolicy,
    ) -> Result<bool, PipelineError> {
        let outcome = outcome.map_err(|err| {
            PipelineError::new(FailureKind::ToolFailure, format!("{:#}", err))
        })?;
        debug!(class = ?outcome.class, elapsed = ?outcome.elapsed, "OCR tool finished");
        match outcome.class {
            OutcomeClass::Success => {
                scope
                    .commit_output()
                    .await
                    .map_err(|err| PipelineError::internal(&err))?;
                Ok(true)
            }
            OutcomeClass::AlreadyHasText => match policy {
                AlreadyHasTextPolicy::PassThrough => {
                    debug!("Document already has text, passing it through");
                    Ok(false)
                }
                AlreadyHasTextPolicy::Reprocess => Err(PipelineError::new(
                    FailureKind::ToolFailure,
                    outcome.describe(),
                )),
            },
            OutcomeClass::ToolFailure => Err(PipelineError::new(
                FailureKind::ToolFailure,
                outcome.describe(),
            )),
            OutcomeClass::Timeout => Err(PipelineError::new(
                FailureKind::Timeout,
                format!(
                    "OCR did not finish within {:?} and was stopped",
                    self.settings.job_timeout
                ),
            )),
            OutcomeClass::Cancelled => Err(PipelineError::new(
                FailureKind::Cancelled,
                "cancelled while OCR was running",
            )),
        }
    }

    /// Best-effort page count, given up on at `deadline`.
    async fn count_pages(&self, path: &Path, deadline: Instant) -> Option<usize> {
        if !self.settings.count_pages {
            return None;
        }
        let limit = deadline.min(Instant::now() + PAGE_COUNT_TIMEOUT);
        if limit <= Instant::now() {
            debug!("no time left to count pages");
            return None;
        }
        match tokio::time::timeout_at(limit, pdf::get_pdf_page_count(path)).await {
            Ok(Ok(pages)) => Some(pages),
            Ok(Err(err)) => {
                debug!("could not count pages: {:#}", err);
                None
            }
            Err(_) => {
                debug!("timed out counting pages");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        invoker::testing::{MockInvoker, MockStats, OCR_MARKER},
        pipeline::request::Document,
    };

    use super::*;

    struct Harness {
        _scratch: tempfile::TempDir,
        orchestrator: Arc<Orchestrator>,
        mock: Arc<MockStats>,
    }

    fn harness(workers: usize, delay: Duration, settings: PipelineSettings) -> Harness {
        harness_with_quota(workers, delay, settings, None)
    }

    fn harness_with_quota(
        workers: usize,
        delay: Duration,
        settings: PipelineSettings,
        quota: Option<u64>,
    ) -> Harness {
        let scratch = tempfile::TempDir::with_prefix("pipeline-test").unwrap();
        let store = ArtifactStore::new(scratch.path().to_owned(), quota).unwrap();
        let invoker = MockInvoker::new(delay);
        let mock = invoker.stats();
        let orchestrator = Orchestrator::new(
            ConcurrencyGate::new(workers).unwrap(),
            store,
            Arc::new(invoker),
            settings,
        );
        Harness {
            _scratch: scratch,
            orchestrator: Arc::new(orchestrator),
            mock,
        }
    }

    fn settings(timeout: Duration) -> PipelineSettings {
        PipelineSettings {
            job_timeout: timeout,
            count_pages: false,
            ..PipelineSettings::default()
        }
    }

    fn pdf_request(marker: &str) -> RecognitionRequest {
        RecognitionRequest::new(Document {
            bytes: format!("%PDF-1.4\n% {marker}\n%%EOF\n").into_bytes(),
            content_type: Some("application/pdf".to_owned()),
            file_name: Some("scan.pdf".to_owned()),
        })
    }

    fn is_idle(h: &Harness) -> bool {
        h.mock.running() == 0
            && h.orchestrator.store().stats().live == 0
            && h.orchestrator.gate().available() == h.orchestrator.gate().capacity()
    }

    fn assert_all_released(h: &Harness) {
        let stats = h.orchestrator.store().stats();
        assert_eq!(stats.live, 0, "{stats:?}");
        assert_eq!(stats.acquired, stats.released, "{stats:?}");
        assert_eq!(stats.reserved_bytes, 0, "{stats:?}");
        assert_eq!(
            h.orchestrator.gate().available(),
            h.orchestrator.gate().capacity()
        );
    }

    #[tokio::test]
    async fn success_returns_ocr_output() -> Result<()> {
        let h = harness(2, Duration::ZERO, settings(Duration::from_secs(10)));
        let request = pdf_request("scanned");
        let input = request.document.bytes.clone();
        let report = h.orchestrator.submit(request).wait().await?;

        let doc = report.result?;
        assert!(doc.ocr_applied);
        let mut expected = input;
        expected.extend_from_slice(OCR_MARKER);
        assert_eq!(doc.bytes, expected);
        assert_eq!(
            report.states,
            vec![
                JobState::Received,
                JobState::Validating,
                JobState::AwaitingSlot,
                JobState::Running,
                JobState::Succeeded,
                JobState::Released,
            ]
        );
        assert_eq!(h.mock.calls(), 1);
        assert_all_released(&h);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_input_never_takes_a_slot() -> Result<()> {
        let h = harness(
            1,
            Duration::ZERO,
            PipelineSettings {
                max_document_bytes: 64,
                ..settings(Duration::from_secs(10))
            },
        );
        // Hold the only slot. Invalid jobs must not wait for it.
        let _slot = h.orchestrator.gate().acquire().await?;

        let cases = [
            (Document::from_bytes(vec![]), FailureKind::InvalidInput),
            (
                Document::from_bytes(vec![0x13, 0x37, 0xca, 0xfe, 0x00, 0xff]),
                FailureKind::InvalidInput,
            ),
            (
                Document {
                    content_type: Some("text/plain".to_owned()),
                    ..Document::from_bytes(b"%PDF-1.4\n".to_vec())
                },
                FailureKind::InvalidInput,
            ),
            (
                Document::from_bytes(b"%PDF-1.4\n".repeat(20)),
                FailureKind::PayloadTooLarge,
            ),
        ];
        for (document, kind) in cases {
            let report = h
                .orchestrator
                .submit(RecognitionRequest::new(document))
                .wait()
                .await?;
            assert_eq!(report.result.unwrap_err().kind, kind);
            assert!(!report.states.contains(&JobState::AwaitingSlot));
            assert_eq!(report.states.last(), Some(&JobState::Released));
        }
        assert_eq!(h.mock.calls(), 0);
        assert_eq!(h.orchestrator.store().stats().acquired, 0);
        Ok(())
    }

    #[tokio::test]
    async fn unsupported_language_is_invalid_input() -> Result<()> {
        let h = harness(
            1,
            Duration::ZERO,
            PipelineSettings {
                supported_languages: vec![Language::English],
                ..settings(Duration::from_secs(10))
            },
        );
        let mut request = pdf_request("swedish");
        request.languages = vec![Language::Swedish];
        let report = h.orchestrator.submit(request).wait().await?;
        let err = report.result.unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidInput);
        assert!(err.detail.contains("swe"));
        assert_eq!(h.mock.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_workers() -> Result<()> {
        let h = harness(3, Duration::from_millis(20), settings(Duration::from_secs(30)));
        let handles = (0..30)
            .map(|i| h.orchestrator.submit(pdf_request(&format!("page {i}"))))
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(handle.wait().await?.result.is_ok());
        }
        assert_eq!(h.mock.calls(), 30);
        assert!(h.mock.max_running() <= 3, "max {}", h.mock.max_running());
        assert!(h.mock.max_running() >= 1);
        assert_all_released(&h);
        Ok(())
    }

    /// Many concurrent jobs with a mix of outcomes, some cancelled by their
    /// callers. Every scope and slot must come back exactly once.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn randomized_jobs_release_everything() -> Result<()> {
        let h = harness(4, Duration::from_millis(5), settings(Duration::from_secs(1)));

        // xorshift, so the mix is repeatable.
        let mut seed: u32 = 0x2545_f491;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        let mut waited = vec![];
        let mut abandoned = vec![];
        for i in 0..120 {
            let request = match next() % 10 {
                0 => pdf_request("MODE:hang"),
                1 | 2 => pdf_request("MODE:fail"),
                3 => pdf_request("MODE:already-has-text"),
                4 => RecognitionRequest::new(Document::from_bytes(vec![i as u8; 16])),
                _ => pdf_request(&format!("ok {i}")),
            };
            let handle = h.orchestrator.submit(request);
            if next() % 8 == 0 {
                abandoned.push(handle);
            } else {
                waited.push(handle);
            }
        }

        // Simulate callers going away mid-job.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(abandoned);

        let mut kinds = vec![];
        for handle in waited {
            let report = handle.wait().await?;
            assert_eq!(report.states.last(), Some(&JobState::Released));
            if let Err(err) = report.result {
                kinds.push(err.kind);
            }
        }
        assert!(kinds.contains(&FailureKind::ToolFailure));
        assert!(kinds.contains(&FailureKind::InvalidInput));

        // Abandoned jobs finish on their own tasks.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !is_idle(&h) {
            assert!(Instant::now() < deadline, "jobs never cleaned up");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.mock.max_running() <= 4);
        assert!(h.orchestrator.store().stats().acquired > 0);
        assert_all_released(&h);
        Ok(())
    }

    #[tokio::test]
    async fn busy_gate_gives_queue_timeout() -> Result<()> {
        let h = harness(1, Duration::ZERO, settings(Duration::from_millis(150)));
        let _slot = h.orchestrator.gate().acquire().await?;

        let report = h.orchestrator.submit(pdf_request("queued")).wait().await?;
        assert_eq!(report.result.unwrap_err().kind, FailureKind::QueueTimeout);
        assert_eq!(
            &report.states[report.states.len() - 3..],
            &[JobState::AwaitingSlot, JobState::TimedOut, JobState::Released]
        );
        assert_eq!(h.mock.calls(), 0);
        assert_eq!(h.orchestrator.store().stats().acquired, 0);
        Ok(())
    }

    #[tokio::test]
    async fn slow_tool_gives_timeout() -> Result<()> {
        let h = harness(1, Duration::ZERO, settings(Duration::from_millis(150)));
        let report = h.orchestrator.submit(pdf_request("MODE:hang")).wait().await?;
        assert_eq!(report.result.unwrap_err().kind, FailureKind::Timeout);
        assert!(report.states.contains(&JobState::Running));
        assert!(report.states.contains(&JobState::TimedOut));
        assert_all_released(&h);
        Ok(())
    }

    #[tokio::test]
    async fn tool_failure_keeps_stderr() -> Result<()> {
        let h = harness(1, Duration::ZERO, settings(Duration::from_secs(10)));
        let report = h.orchestrator.submit(pdf_request("MODE:fail")).wait().await?;
        let err = report.result.unwrap_err();
        assert_eq!(err.kind, FailureKind::ToolFailure);
        assert!(err.detail.contains("exited with code 2"));
        assert!(err.detail.contains("not a valid PDF"));
        assert_all_released(&h);
        Ok(())
    }

    #[tokio::test]
    async fn pass_through_is_byte_identical() -> Result<()> {
        let h = harness(1, Duration::ZERO, settings(Duration::from_secs(10)));
        let mut outputs = vec![];
        for _ in 0..2 {
            let request = pdf_request("MODE:already-has-text");
            let input = request.document.bytes.clone();
            let doc = h.orchestrator.submit(request).wait().await?.result?;
            assert!(!doc.ocr_applied);
            assert_eq!(doc.bytes, input);
            outputs.push(doc.bytes);
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_all_released(&h);
        Ok(())
    }

    #[tokio::test]
    async fn already_has_text_under_reprocess_is_failure() -> Result<()> {
        let h = harness(1, Duration::ZERO, settings(Duration::from_secs(10)));
        let mut request = pdf_request("MODE:already-has-text");
        request.already_has_text = Some(AlreadyHasTextPolicy::Reprocess);
        let report = h.orchestrator.submit(request).wait().await?;
        assert_eq!(report.result.unwrap_err().kind, FailureKind::ToolFailure);
        Ok(())
    }

    #[tokio::test]
    async fn scratch_quota_is_resource_exhausted() -> Result<()> {
        let h = harness_with_quota(
            1,
            Duration::ZERO,
            settings(Duration::from_secs(10)),
            Some(8),
        );
        let report = h.orchestrator.submit(pdf_request("big")).wait().await?;
        assert_eq!(
            report.result.unwrap_err().kind,
            FailureKind::ResourceExhausted
        );
        assert_eq!(h.mock.calls(), 0);
        assert_all_released(&h);
        Ok(())
    }

    #[tokio::test]
    async fn page_count_respects_the_deadline() -> Result<()> {
        let h = harness(
            1,
            Duration::ZERO,
            PipelineSettings {
                count_pages: true,
                ..settings(Duration::from_secs(10))
            },
        );
        let dir = tempfile::TempDir::with_prefix("page-count-test")?;
        let path = dir.path().join("minimal.pdf");
        std::fs::write(&path, crate::pdf::tests::MINIMAL_PDF)?;

        let started = Instant::now();
        let expired = started - Duration::from_millis(1);
        assert_eq!(h.orchestrator.count_pages(&path, expired).await, None);
        assert!(started.elapsed() < Duration::from_millis(100));
        Ok(())
    }

    #[tokio::test]
    async fn cancel_while_queued() -> Result<()> {
        let h = harness(1, Duration::ZERO, settings(Duration::from_secs(30)));
        let slot = h.orchestrator.gate().acquire().await?;

        let handle = h.orchestrator.submit(pdf_request("queued"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let report = handle.cancel().await?;
        assert_eq!(report.result.unwrap_err().kind, FailureKind::Cancelled);
        assert_eq!(
            &report.states[report.states.len() - 3..],
            &[JobState::AwaitingSlot, JobState::Cancelled, JobState::Released]
        );
        assert_eq!(h.mock.calls(), 0);

        drop(slot);
        assert_all_released(&h);
        Ok(())
    }

    /// A one-page PDF with `text` set in large Helvetica as real text.
    fn text_pdf(text: &str) -> Vec<u8> {
        let content = format!("BT /F1 48 Tf 72 650 Td ({text}) Tj ET");
        let objects = [
            "<< /Type /Catalog /Pages 2 0 R >>".to_owned(),
            "<< /Type /Pages /Kids [3 0 R] /Count 1 >>".to_owned(),
            "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
             /Resources << /Font << /F1 4 0 R >> >> /Contents 5 0 R >>"
                .to_owned(),
            "<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_owned(),
            format!(
                "<< /Length {} >>\nstream\n{content}\nendstream",
                content.len()
            ),
        ];
        let mut pdf = b"%PDF-1.4\n".to_vec();
        let mut offsets = vec![];
        for (i, object) in objects.iter().enumerate() {
            offsets.push(pdf.len());
            pdf.extend_from_slice(format!("{} 0 obj\n{object}\nendobj\n", i + 1).as_bytes());
        }
        let xref = pdf.len();
        let size = objects.len() + 1;
        pdf.extend_from_slice(format!("xref\n0 {size}\n0000000000 65535 f \n").as_bytes());
        for offset in offsets {
            pdf.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
        }
        pdf.extend_from_slice(
            format!("trailer\n<< /Size {size} /Root 1 0 R >>\nstartxref\n{xref}\n%%EOF\n")
                .as_bytes(),
        );
        pdf
    }

    /// Run Ghostscript on `input`, writing `output`.
    async fn ghostscript(input: &Path, output: &Path, device_args: &[&str]) -> Result<()> {
        let result = tokio::process::Command::new("gs")
            .args(["-q", "-dNOPAUSE", "-dBATCH", "-dSAFER"])
            .args(device_args)
            .arg(format!("-sOutputFile={}", output.display()))
            .arg(input)
            .output()
            .await
            .context("failed to run gs")?;
        crate::async_utils::check_for_command_failure("gs", &result)
    }

    /// Extract text with `pdftotext`.
    async fn pdftotext(path: &Path) -> Result<String> {
        let result = tokio::process::Command::new("pdftotext")
            .arg(path)
            .arg("-")
            .output()
            .await
            .context("failed to run pdftotext")?;
        crate::async_utils::check_for_command_failure("pdftotext", &result)?;
        Ok(String::from_utf8_lossy(&result.stdout).into_owned())
    }

    fn real_orchestrator(scratch: &Path) -> Result<Orchestrator> {
        use crate::invoker::ocrmypdf::{OcrmypdfInvoker, OcrmypdfOptions};

        Ok(Orchestrator::new(
            ConcurrencyGate::new(1)?,
            ArtifactStore::new(scratch.to_owned(), None)?,
            Arc::new(OcrmypdfInvoker::new(OcrmypdfOptions::default())),
            PipelineSettings::default(),
        ))
    }

    fn pdf_document(bytes: Vec<u8>) -> Document {
        Document {
            bytes,
            content_type: Some("application/pdf".to_owned()),
            file_name: Some("scan.pdf".to_owned()),
        }
    }

    #[tokio::test]
    #[ignore = "Requires ocrmypdf, Ghostscript and poppler-utils to be installed"]
    async fn scanned_english_page_gets_a_text_layer() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("real-ocr-test")?;
        let text_path = dir.path().join("text.pdf");
        let scanned_path = dir.path().join("scanned.pdf");
        std::fs::write(&text_path, text_pdf("Hello World"))?;
        // An image-only copy, like a scanner would produce.
        ghostscript(&text_path, &scanned_path, &["-sDEVICE=pdfimage24", "-r200"]).await?;
        assert!(!pdftotext(&scanned_path).await?.to_lowercase().contains("hello"));

        let orchestrator = real_orchestrator(&dir.path().join("scratch"))?;
        let mut request = RecognitionRequest::new(pdf_document(std::fs::read(&scanned_path)?));
        request.languages = vec![Language::English];
        let (_cancel, signal) = cancel_pair();
        let doc = orchestrator.run(request, signal).await.result?;
        assert!(doc.ocr_applied);
        assert_eq!(doc.page_count, Some(1));

        let output_path = dir.path().join("output.pdf");
        std::fs::write(&output_path, &doc.bytes)?;
        let text = pdftotext(&output_path).await?;
        assert!(text.to_lowercase().contains("hello"), "{text:?}");

        // The output already has text, so a second run passes it through.
        let (_cancel, signal) = cancel_pair();
        let again = orchestrator
            .run(RecognitionRequest::new(pdf_document(doc.bytes.clone())), signal)
            .await
            .result?;
        assert!(!again.ocr_applied);
        assert_eq!(again.bytes, doc.bytes);
        assert_eq!(orchestrator.store().stats().live, 0);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "Requires ocrmypdf and Ghostscript to be installed"]
    async fn encrypted_pdf_is_tool_failure() -> Result<()> {
        let dir = tempfile::TempDir::with_prefix("real-ocr-test")?;
        let text_path = dir.path().join("text.pdf");
        let encrypted_path = dir.path().join("encrypted.pdf");
        std::fs::write(&text_path, text_pdf("Secret"))?;
        ghostscript(
            &text_path,
            &encrypted_path,
            &[
                "-sDEVICE=pdfwrite",
                "-sOwnerPassword=owner",
                "-sUserPassword=user",
                "-dEncryptionR=3",
                "-dKeyLength=128",
            ],
        )
        .await?;

        let orchestrator = real_orchestrator(&dir.path().join("scratch"))?;
        let request = RecognitionRequest::new(pdf_document(std::fs::read(&encrypted_path)?));
        let (_cancel, signal) = cancel_pair();
        let report = orchestrator.run(request, signal).await;
        let err = report.result.unwrap_err();
        assert_eq!(err.kind, FailureKind::ToolFailure);
        assert!(err.detail.contains("encrypted"), "{}", err.detail);
        assert_eq!(orchestrator.store().stats().live, 0);
        Ok(())
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_a_running_job() -> Result<()> {
        let h = harness(1, Duration::ZERO, settings(Duration::from_secs(30)));
        let handle = h.orchestrator.submit(pdf_request("MODE:hang"));
        while h.mock.running() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(handle);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !is_idle(&h) {
            assert!(Instant::now() < deadline, "job was never cancelled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_all_released(&h);
        Ok(())
    }
}
