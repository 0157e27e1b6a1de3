//! Process configuration, from command-line flags with environment-variable
//! fallbacks. Read once at start-up.

use std::{str::FromStr, sync::Arc, time::Duration};

use clap::{ArgAction, Args};

use crate::{
    artifacts::ArtifactStore,
    gate::ConcurrencyGate,
    invoker::ocrmypdf::{OcrmypdfInvoker, OcrmypdfOptions},
    language::Language,
    pipeline::{Orchestrator, PipelineSettings, request::AlreadyHasTextPolicy},
    prelude::*,
};

/// Name of our directory under the system temp dir.
const DEFAULT_SCRATCH_DIR_NAME: &str = "ocr-gateway";

/// A non-empty list of languages, like `eng,swe` or `eng+swe`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LanguageList(pub Vec<Language>);

impl FromStr for LanguageList {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let languages = Language::parse_list(s)?;
        if languages.is_empty() {
            return Err(anyhow!("expected at least one language"));
        }
        Ok(LanguageList(languages))
    }
}

/// Options for the OCR pipeline, shared by `serve` and `ocr`.
#[derive(Clone, Debug, Args)]
pub struct PipelineOpts {
    /// How many documents to OCR at once. Defaults to the number of CPUs.
    #[clap(long, env = "OCR_WORKERS", default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Overall time limit per document, including time spent queued.
    #[clap(long, env = "OCR_JOB_TIMEOUT_SECS", default_value_t = 300)]
    pub job_timeout_secs: u64,

    /// Largest document we accept, in bytes.
    #[clap(long, env = "OCR_MAX_UPLOAD_BYTES", default_value_t = 12 * 1024 * 1024)]
    pub max_upload_bytes: usize,

    /// Languages with installed `tesseract` language packs.
    #[clap(long, env = "OCR_LANGUAGES", default_value = "eng,swe")]
    pub languages: LanguageList,

    /// Languages to use when a request doesn't say.
    #[clap(long, env = "OCR_DEFAULT_LANGUAGES", default_value = "eng")]
    pub default_languages: LanguageList,

    /// What to do with documents that already contain text.
    #[clap(
        long,
        env = "OCR_ALREADY_HAS_TEXT",
        value_enum,
        default_value_t = AlreadyHasTextPolicy::PassThrough
    )]
    pub already_has_text: AlreadyHasTextPolicy,

    /// Path to the `ocrmypdf` executable.
    #[clap(long = "ocrmypdf", env = "OCRMYPDF_PATH", default_value = "ocrmypdf")]
    pub ocrmypdf_path: PathBuf,

    /// Threads each `ocrmypdf` run may use.
    #[clap(long, env = "OCR_THREADS_PER_JOB", default_value_t = 1)]
    pub threads_per_job: usize,

    /// `ocrmypdf` optimization level, 0 to 3.
    #[clap(
        long,
        env = "OCR_OPTIMIZE",
        default_value_t = 1,
        value_parser = clap::value_parser!(u8).range(0..=3)
    )]
    pub optimize: u8,

    /// Straighten crooked scans before OCR.
    #[clap(long, env = "OCR_DESKEW")]
    pub deskew: bool,

    /// Where to keep per-job scratch files. Defaults to a directory under
    /// the system temp dir.
    #[clap(long, env = "OCR_SCRATCH_DIR")]
    pub scratch_dir: Option<PathBuf>,

    /// Cap on scratch space reserved by in-flight jobs, in bytes.
    #[clap(long, env = "OCR_SCRATCH_QUOTA_BYTES")]
    pub scratch_quota_bytes: Option<u64>,

    /// Count pages in returned documents (requires `pdfinfo`).
    #[clap(
        long,
        env = "OCR_COUNT_PAGES",
        default_value_t = true,
        action = ArgAction::Set,
        value_name = "BOOL"
    )]
    pub count_pages: bool,
}

impl PipelineOpts {
    /// Check everything we can check without touching the system.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(anyhow!("--workers must be at least 1"));
        }
        if self.job_timeout_secs == 0 {
            return Err(anyhow!("--job-timeout-secs must be greater than 0"));
        }
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("--max-upload-bytes must be greater than 0"));
        }
        if self.threads_per_job == 0 {
            return Err(anyhow!("--threads-per-job must be at least 1"));
        }
        if let Some(language) = self
            .default_languages
            .0
            .iter()
            .find(|language| !self.languages.0.contains(language))
        {
            return Err(anyhow!(
                "default language {} is not in the supported languages ({})",
                language,
                Language::join_codes(&self.languages.0)
            ));
        }
        Ok(())
    }

    /// Settings for the orchestrator.
    pub fn settings(&self) -> PipelineSettings {
        PipelineSettings {
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            max_document_bytes: self.max_upload_bytes,
            supported_languages: self.languages.0.clone(),
            default_languages: self.default_languages.0.clone(),
            already_has_text: self.already_has_text,
            count_pages: self.count_pages,
        }
    }

    /// Settings for the `ocrmypdf` invoker.
    pub fn invoker_options(&self) -> OcrmypdfOptions {
        OcrmypdfOptions {
            program: self.ocrmypdf_path.clone(),
            threads_per_job: self.threads_per_job,
            optimize: self.optimize,
            deskew: self.deskew,
            ..OcrmypdfOptions::default()
        }
    }

    /// Where scratch files go.
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_SCRATCH_DIR_NAME))
    }

    /// Validate our options and build an orchestrator keeping its scratch
    /// files under `scratch_root`. If `sweep_stale` is set, first remove job
    /// directories left over from an earlier run. Only do that if nothing
    /// else is using `scratch_root`.
    #[instrument(level = "debug", skip_all, fields(scratch_root = %scratch_root.display()))]
    pub fn build_orchestrator(
        &self,
        scratch_root: &Path,
        sweep_stale: bool,
    ) -> Result<Arc<Orchestrator>> {
        self.validate()?;
        let store = ArtifactStore::new(scratch_root.to_owned(), self.scratch_quota_bytes)?;
        if sweep_stale {
            store.sweep_stale()?;
        }
        let gate = ConcurrencyGate::new(self.workers)?;
        let invoker = OcrmypdfInvoker::new(self.invoker_options());
        info!(
            workers = self.workers,
            scratch = %store.root().display(),
            languages = %Language::join_codes(&self.languages.0),
            "Configured OCR pipeline"
        );
        Ok(Arc::new(Orchestrator::new(
            gate,
            store,
            Arc::new(invoker),
            self.settings(),
        )))
    }
}

/// Options for the HTTP server.
#[derive(Clone, Debug, Args)]
pub struct ServerOpts {
    /// Address or host name to listen on.
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[clap(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// How long to keep idle connections open. 0 disables keep-alive.
    #[clap(long, env = "KEEP_ALIVE_SECS", default_value_t = 5)]
    pub keep_alive_secs: u64,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

impl ServerOpts {
    pub fn keep_alive(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }
}
