//! Invoker wrapping the `ocrmypdf` CLI tool.
//!
//! `ocrmypdf` drives `tesseract`, Ghostscript and a PDF renderer for us, and
//! writes a copy of the input with an invisible text layer on each page.

use std::{
    ffi::OsString,
    io,
    process::{ExitStatus, Stdio},
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;
use tokio::{
    process::{Child, Command},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    async_utils::{CancelSignal, read_tail},
    language::Language,
    prelude::*,
};

use super::{
    InvocationOutcome, InvocationRequest, OcrInvoker, OutcomeClass, TextLayerMode,
};

/// How much of stderr we keep for error messages.
const STDERR_EXCERPT_BYTES: usize = 4 * 1024;

/// How much of stdout we keep for debug logs. `ocrmypdf` says very little
/// on stdout when writing to a file.
const STDOUT_EXCERPT_BYTES: usize = 1024;

/// `ocrmypdf` exit codes we care about.
const EXIT_OK: i32 = 0;
const EXIT_ALREADY_DONE_OCR: i32 = 6;

/// Signature of "this page already has text" in `ocrmypdf` logs. Checked in
/// addition to the exit code, since older versions exit differently.
static ALREADY_HAS_TEXT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)page already has text|PriorOcrFoundError")
        .expect("failed to compile regex")
});

/// Human-readable meaning of an `ocrmypdf` exit code.
pub fn describe_exit_code(code: i32) -> &'static str {
    match code {
        0 => "ok",
        1 => "bad arguments",
        2 => "invalid input file",
        3 => "missing dependency",
        4 => "output file is invalid",
        5 => "file access error",
        6 => "document already has text",
        7 => "child process error",
        8 => "input PDF is encrypted",
        9 => "invalid configuration",
        10 => "PDF/A conversion failed",
        15 => "other error",
        130 => "interrupted",
        _ => "unknown error",
    }
}

/// Classify a finished run.
pub fn classify(
    exit_code: Option<i32>,
    stderr: &str,
    output_exists: bool,
    mode: TextLayerMode,
) -> OutcomeClass {
    match exit_code {
        Some(EXIT_OK) if output_exists => OutcomeClass::Success,
        Some(EXIT_ALREADY_DONE_OCR) => OutcomeClass::AlreadyHasText,
        // With `--skip-text`, "already has text" shows up in normal logs.
        Some(code)
            if code != EXIT_OK
                && mode != TextLayerMode::SkipText
                && ALREADY_HAS_TEXT_REGEX.is_match(stderr) =>
        {
            OutcomeClass::AlreadyHasText
        }
        _ => OutcomeClass::ToolFailure,
    }
}

/// Settings for [`OcrmypdfInvoker`].
#[derive(Clone, Debug)]
pub struct OcrmypdfOptions {
    /// Path to the `ocrmypdf` executable.
    pub program: PathBuf,
    /// Value for `--jobs`. Our concurrency gate already spreads work across
    /// cores, so this is normally 1.
    pub threads_per_job: usize,
    /// Value for `--optimize` (0 to 3).
    pub optimize: u8,
    /// Pass `--deskew`.
    pub deskew: bool,
    /// How long to wait for a killed process to be reaped.
    pub kill_grace: Duration,
}

impl Default for OcrmypdfOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ocrmypdf"),
            threads_per_job: 1,
            optimize: 1,
            deskew: false,
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// Runs `ocrmypdf` in its own process group, so that a timeout can take down
/// `tesseract` and Ghostscript along with it.
pub struct OcrmypdfInvoker {
    options: OcrmypdfOptions,
}

impl OcrmypdfInvoker {
    /// Create a new invoker.
    pub fn new(options: OcrmypdfOptions) -> Self {
        Self { options }
    }

    /// Build the argument list for a request.
    ///
    /// Everything here comes from our own configuration, from [`Language`]
    /// codes, or from store-generated paths. The paths follow `--`, so
    /// they can never be parsed as options.
    pub fn build_args(&self, request: &InvocationRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--output-type".into(),
            "pdf".into(),
            "--jobs".into(),
            self.options.threads_per_job.max(1).to_string().into(),
            "--optimize".into(),
            self.options.optimize.min(3).to_string().into(),
        ];
        if !request.languages.is_empty() {
            args.push("--language".into());
            args.push(Language::join_codes(&request.languages).into());
        }
        match request.mode {
            TextLayerMode::Standard => {}
            TextLayerMode::SkipText => args.push("--skip-text".into()),
            TextLayerMode::ForceOcr => args.push("--force-ocr".into()),
        }
        if self.options.deskew && request.mode != TextLayerMode::SkipText {
            args.push("--deskew".into());
        }
        args.push("--".into());
        args.push(request.input.clone().into_os_string());
        args.push(request.staging_output.clone().into_os_string());
        args
    }

    /// Kill the whole process group and reap the child, waiting at most
    /// `kill_grace`.
    async fn terminate(&self, child: &mut Child, group: &mut ProcessGroup) {
        group.kill();
        if let Err(err) = child.start_kill() {
            debug!("could not signal ocrmypdf directly: {}", err);
        }
        match tokio::time::timeout(self.options.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                group.disarm();
                debug!(%status, "Reaped killed ocrmypdf");
            }
            Ok(Err(err)) => error!("failed to reap killed ocrmypdf: {}", err),
            Err(_) => error!(
                grace = ?self.options.kill_grace,
                "ocrmypdf did not exit after being killed"
            ),
        }
    }
}

/// How the wait for the child ended.
enum Ending {
    Exited(io::Result<ExitStatus>),
    DeadlinePassed,
    Cancelled,
}

#[async_trait]
impl OcrInvoker for OcrmypdfInvoker {
    #[instrument(level = "debug", skip_all, fields(input = %request.input.display()))]
    async fn invoke(
        &self,
        request: InvocationRequest,
        deadline: Instant,
        cancel: &mut CancelSignal,
    ) -> Result<InvocationOutcome> {
        let started = Instant::now();
        if started >= deadline {
            return Ok(InvocationOutcome {
                class: OutcomeClass::Timeout,
                exit_code: None,
                stderr_excerpt: String::new(),
                elapsed: Duration::ZERO,
            });
        }

        let mut cmd = Command::new(&self.options.program);
        cmd.args(self.build_args(&request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = cmd.spawn().with_context(|| {
            format!("cannot run {:?}", self.options.program.display())
        })?;
        let mut group = ProcessGroup::new(child.id());

        // Drain both pipes while we wait, or a chatty run could fill one and
        // block forever.
        let stdout = tokio::spawn(read_tail(child.stdout.take(), STDOUT_EXCERPT_BYTES));
        let stderr = tokio::spawn(read_tail(child.stderr.take(), STDERR_EXCERPT_BYTES));

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = tokio::time::sleep_until(deadline) => Ending::DeadlinePassed,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        let (exit_code, forced_class) = match ending {
            Ending::Exited(status) => {
                let status = status.context("failed to wait for ocrmypdf")?;
                group.disarm();
                (status.code(), None)
            }
            Ending::DeadlinePassed => {
                warn!(elapsed = ?started.elapsed(), "ocrmypdf passed its deadline, killing it");
                self.terminate(&mut child, &mut group).await;
                (None, Some(OutcomeClass::Timeout))
            }
            Ending::Cancelled => {
                info!("Job cancelled, killing ocrmypdf");
                self.terminate(&mut child, &mut group).await;
                (None, Some(OutcomeClass::Cancelled))
            }
        };

        let grace = self.options.kill_grace;
        let stdout_excerpt = collect_output("stdout", stdout, grace).await;
        let stderr_excerpt = collect_output("stderr", stderr, grace).await;
        debug!(output = %stdout_excerpt, "Standard output from ocrmypdf");

        let class = match forced_class {
            Some(class) => class,
            None => {
                let output_exists = tokio::fs::try_exists(&request.staging_output)
                    .await
                    .unwrap_or(false);
                classify(exit_code, &stderr_excerpt, output_exists, request.mode)
            }
        };
        if class == OutcomeClass::ToolFailure {
            warn!(exit_code = ?exit_code, output = %stderr_excerpt, "ocrmypdf failed");
        } else {
            debug!(output = %stderr_excerpt, "Standard error from ocrmypdf");
        }

        Ok(InvocationOutcome {
            class,
            exit_code,
            stderr_excerpt,
            elapsed: started.elapsed(),
        })
    }
}

/// Wait (briefly) for a pipe reader task to finish.
async fn collect_output(
    name: &str,
    handle: JoinHandle<io::Result<String>>,
    grace: Duration,
) -> String {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(Ok(text))) => text,
        Ok(Ok(Err(err))) => {
            debug!("failed to read ocrmypdf {}: {}", name, err);
            String::new()
        }
        Ok(Err(err)) => {
            error!("ocrmypdf {} reader panicked: {}", name, err);
            String::new()
        }
        Err(_) => {
            warn!("ocrmypdf {} stayed open after exit", name);
            String::new()
        }
    }
}

/// The process group of a spawned child. Kills the group on drop unless
/// disarmed, which we do once the child has been reaped.
///
/// [`Command::kill_on_drop`] only reaches the direct child; this reaches
/// `tesseract` and friends too.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid }
    }

    /// Don't kill anything on drop. Called once the leader is reaped, after
    /// which its id may be reused.
    fn disarm(&mut self) {
        self.pgid = None;
    }

    #[cfg(unix)]
    fn kill(&self) {
        let Some(pgid) = self.pgid.and_then(|pid| libc::pid_t::try_from(pid).ok())
        else {
            return;
        };
        // SAFETY: `killpg` takes plain integers and touches no memory of
        // ours. The group was created by `process_group(0)`, so its id is the
        // unreaped child's pid.
        let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if rc != 0 {
            debug!(
                pgid,
                "killpg failed: {}",
                io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn kill(&self) {}
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.pgid.is_some() {
            self.kill();
        }
    }
}
