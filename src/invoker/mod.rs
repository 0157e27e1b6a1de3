//! OCR invoker interface.
//!
//! An invoker runs the OCR tool exactly once against a job's files, bounded
//! by a deadline and a cancellation signal. It reports what happened, and
//! leaves deciding what that *means* to the pipeline.

use std::time::Duration;

use tokio::time::Instant;

use crate::{async_utils::CancelSignal, language::Language, prelude::*};

pub mod ocrmypdf;
#[cfg(test)]
pub mod testing;

/// How the OCR tool should treat pages that already contain text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TextLayerMode {
    /// OCR image pages. If any page already has text, the tool refuses and we
    /// get [`OutcomeClass::AlreadyHasText`].
    #[default]
    Standard,
    /// Leave pages with text alone, OCR the rest.
    SkipText,
    /// Rasterize every page and OCR it, discarding existing text.
    ForceOcr,
}

/// Everything an invoker needs to run one job. Paths are always
/// store-generated, never supplied by a client.
#[derive(Clone, Debug)]
pub struct InvocationRequest {
    /// The input PDF.
    pub input: PathBuf,
    /// Where to write the output PDF. Moved into place by the caller only
    /// after [`OutcomeClass::Success`].
    pub staging_output: PathBuf,
    /// Languages to recognize. Non-empty and canonical.
    pub languages: Vec<Language>,
    /// How to handle existing text.
    pub mode: TextLayerMode,
}

/// What kind of ending an invocation had.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeClass {
    /// The staging output holds a searchable PDF.
    Success,
    /// The tool declined because the document already has text.
    AlreadyHasText,
    /// The tool failed on this document.
    ToolFailure,
    /// We killed the tool because the deadline passed.
    Timeout,
    /// We killed the tool because the caller went away.
    Cancelled,
}

/// The result of one invocation.
#[derive(Clone, Debug)]
pub struct InvocationOutcome {
    /// How it ended.
    pub class: OutcomeClass,
    /// The tool's exit code, if it exited normally.
    pub exit_code: Option<i32>,
    /// The tail end of the tool's stderr.
    pub stderr_excerpt: String,
    /// Wall-clock time spent.
    pub elapsed: Duration,
}

impl InvocationOutcome {
    /// A short description suitable for an error message.
    pub fn describe(&self) -> String {
        let mut description = match self.exit_code {
            Some(code) => format!(
                "OCR tool exited with code {} ({})",
                code,
                ocrmypdf::describe_exit_code(code)
            ),
            None => "OCR tool did not exit normally".to_owned(),
        };
        let excerpt = self.stderr_excerpt.trim();
        if !excerpt.is_empty() {
            description.push_str(":\n");
            description.push_str(excerpt);
        }
        description
    }
}

/// Interface to an OCR tool.
#[async_trait]
pub trait OcrInvoker: Send + Sync + 'static {
    /// Run the tool once.
    ///
    /// Must return by `deadline` (plus a short grace period for killing the
    /// process) with [`OutcomeClass::Timeout`], and promptly with
    /// [`OutcomeClass::Cancelled`] once `cancel` fires. Errors mean the tool
    /// could not be run at all.
    async fn invoke(
        &self,
        request: InvocationRequest,
        deadline: Instant,
        cancel: &mut CancelSignal,
    ) -> Result<InvocationOutcome>;
}
