//! The `ocr` subcommand.

use clap::Args;

use crate::{
    async_utils::{cancel_pair, io::write_output},
    config::{LanguageList, PipelineOpts},
    pipeline::request::{AlreadyHasTextPolicy, Document, RecognitionRequest},
    prelude::*,
    ui::{ProgressConfig, Ui},
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// The PDF to OCR.
    pub input_path: PathBuf,

    /// Where to write the searchable PDF. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Languages in the document, like `eng+swe`.
    #[clap(id = "request_languages", short = 'l', long = "language", value_name = "LANGUAGES")]
    pub languages: Option<LanguageList>,

    /// Leave pages that already have text alone.
    #[clap(long)]
    pub skip_text: bool,

    /// Override the configured policy for documents that already have text.
    #[clap(long = "on-text", value_enum, value_name = "POLICY")]
    pub on_text: Option<AlreadyHasTextPolicy>,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all, fields(input = %opts.input_path.display()))]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let bytes = tokio::fs::read(&opts.input_path)
        .await
        .with_context(|| format!("failed to read {:?}", opts.input_path.display()))?;
    let document = Document {
        bytes,
        content_type: None,
        file_name: opts
            .input_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
    };
    let request = RecognitionRequest {
        languages: opts
            .languages
            .as_ref()
            .map(|list| list.0.clone())
            .unwrap_or_default(),
        skip_text: opts.skip_text,
        already_has_text: opts.on_text,
        ..RecognitionRequest::new(document)
    };

    // Use a private scratch directory unless told otherwise, so we never
    // touch a running server's files.
    let private_scratch = match &opts.pipeline.scratch_dir {
        Some(_) => None,
        None => Some(
            tempfile::TempDir::with_prefix("ocr-gateway-cli")
                .context("failed to create scratch directory")?,
        ),
    };
    let scratch_root = match &private_scratch {
        Some(dir) => dir.path().to_owned(),
        None => opts.pipeline.scratch_root(),
    };
    let orchestrator = opts.pipeline.build_orchestrator(&scratch_root, false)?;

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "📄",
        msg: "Adding text layer",
        done_msg: "Finished",
    });
    let (cancel, signal) = cancel_pair();
    let run = orchestrator.run(request, signal);
    tokio::pin!(run);
    let report = tokio::select! {
        report = &mut run => report,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping OCR");
            cancel.cancel();
            run.await
        }
    };
    drop(spinner);

    let document = report.result?;
    info!(
        job_id = %report.job_id,
        elapsed = ?report.elapsed,
        ocr_applied = document.ocr_applied,
        pages = ?document.page_count,
        "OCR finished"
    );
    write_output(opts.output_path.as_deref(), &document.bytes).await
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory as _, Parser};

    use crate::language::Language;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestOpts {
        #[clap(flatten)]
        ocr: OcrOpts,
    }

    #[test]
    fn document_and_supported_languages_are_separate() -> Result<()> {
        TestOpts::command().debug_assert();
        let opts = TestOpts::try_parse_from([
            "test",
            "scan.pdf",
            "-l",
            "swe",
            "--languages",
            "eng,swe",
            "--default-languages",
            "eng",
        ])?
        .ocr;
        assert_eq!(opts.languages, Some(LanguageList(vec![Language::Swedish])));
        assert_eq!(
            opts.pipeline.languages,
            LanguageList(vec![Language::English, Language::Swedish])
        );
        assert_eq!(
            opts.pipeline.default_languages,
            LanguageList(vec![Language::English])
        );
        Ok(())
    }

    #[test]
    fn unknown_document_language_is_rejected() {
        let err = TestOpts::try_parse_from(["test", "scan.pdf", "--language", "klingon"])
            .unwrap_err();
        assert!(err.to_string().contains("Unsupported OCR language"), "{err}");
    }
}
