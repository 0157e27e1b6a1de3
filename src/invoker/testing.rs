//! An in-process [`OcrInvoker`] for tests.
//!
//! Like the fake `ocrmypdf` script, it picks its behavior from a marker in
//! the input file, so tests can mix outcomes in a single burst of jobs:
//!
//! - `MODE:already-has-text`: report [`OutcomeClass::AlreadyHasText`].
//! - `MODE:fail`: report [`OutcomeClass::ToolFailure`].
//! - `MODE:hang`: run until the deadline or cancellation.
//! - anything else: wait for the configured delay, then append
//!   [`OCR_MARKER`] to the input and write it to the staging output.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use crate::{async_utils::CancelSignal, prelude::*};

use super::{InvocationOutcome, InvocationRequest, OcrInvoker, OutcomeClass};

/// Appended to "recognized" documents.
pub const OCR_MARKER: &[u8] = b"\n% text layer added\n";

/// Counters shared between a [`MockInvoker`] and the test inspecting it.
#[derive(Debug, Default)]
pub struct MockStats {
    calls: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl MockStats {
    /// Total calls to `invoke`.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls currently in progress.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// The highest value `running` has ever had.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

/// Decrements `running` however `invoke` exits.
struct RunningGuard<'a>(&'a MockStats);

impl<'a> RunningGuard<'a> {
    fn enter(stats: &'a MockStats) -> Self {
        stats.calls.fetch_add(1, Ordering::SeqCst);
        let now = stats.running.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_running.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// See the module docs.
#[derive(Clone, Debug, Default)]
pub struct MockInvoker {
    delay: Duration,
    stats: Arc<MockStats>,
}

impl MockInvoker {
    /// A mock that takes `delay` to "recognize" a document.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Shared counters.
    pub fn stats(&self) -> Arc<MockStats> {
        self.stats.clone()
    }
}

#[async_trait]
impl OcrInvoker for MockInvoker {
    async fn invoke(
        &self,
        request: InvocationRequest,
        deadline: Instant,
        cancel: &mut CancelSignal,
    ) -> Result<InvocationOutcome> {
        let _running = RunningGuard::enter(&self.stats);
        let started = Instant::now();
        let input = tokio::fs::read(&request.input).await?;
        let contains =
            |marker: &[u8]| input.windows(marker.len()).any(|window| window == marker);

        let outcome = |class: OutcomeClass, exit_code: Option<i32>, stderr: &str| {
            InvocationOutcome {
                class,
                exit_code,
                stderr_excerpt: stderr.to_owned(),
                elapsed: started.elapsed(),
            }
        };

        let delay = if contains(b"MODE:hang") {
            Duration::from_secs(3600)
        } else {
            self.delay
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(outcome(OutcomeClass::Timeout, None, ""));
            }
            _ = cancel.cancelled() => {
                return Ok(outcome(OutcomeClass::Cancelled, None, ""));
            }
        }

        if contains(b"MODE:already-has-text") {
            Ok(outcome(
                OutcomeClass::AlreadyHasText,
                Some(6),
                "ERROR - page already has text!",
            ))
        } else if contains(b"MODE:fail") {
            Ok(outcome(
                OutcomeClass::ToolFailure,
                Some(2),
                "ERROR - not a valid PDF",
            ))
        } else {
            let mut output = input.clone();
            output.extend_from_slice(OCR_MARKER);
            tokio::fs::write(&request.staging_output, output).await?;
            Ok(outcome(OutcomeClass::Success, Some(0), ""))
        }
    }
}
