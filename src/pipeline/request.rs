//! What a caller asks the pipeline to do.

use clap::ValueEnum;

use crate::{language::Language, prelude::*};

/// Content types we accept as "this is a PDF".
///
/// `application/octet-stream` is here because browsers and `curl` use it for
/// anything they don't recognize. We sniff the bytes either way.
const PDF_CONTENT_TYPES: &[&str] =
    &["application/pdf", "application/x-pdf", "application/octet-stream"];

/// An uploaded document. We never trust anything here except the bytes, and
/// even those get sniffed before use.
#[derive(Clone)]
pub struct Document {
    /// The raw file contents.
    pub bytes: Vec<u8>,

    /// The content type the client declared, if any.
    pub content_type: Option<String>,

    /// The client's name for the file. Only used to build a download name.
    pub file_name: Option<String>,
}

impl Document {
    /// Create a document with no metadata.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: None,
            file_name: None,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Is the declared content type (if any) one we accept?
    pub fn has_acceptable_content_type(&self) -> bool {
        match &self.content_type {
            None => true,
            Some(content_type) => is_pdf_content_type(content_type),
        }
    }

    /// Could the client's file name (if any) be a PDF? Names without an
    /// extension we recognize are accepted.
    pub fn has_plausible_file_name(&self) -> bool {
        let Some(file_name) = &self.file_name else {
            return true;
        };
        match mime_guess::from_path(file_name).first() {
            None => true,
            Some(mime) => is_pdf_content_type(mime.essence_str()),
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("len", &self.bytes.len())
            .field("content_type", &self.content_type)
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// Does this content type (ignoring parameters) name a PDF?
pub fn is_pdf_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    PDF_CONTENT_TYPES.contains(&essence.as_str())
}

/// What to do when the OCR tool finds a document that already has text.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum AlreadyHasTextPolicy {
    /// Return the original document, byte for byte.
    #[default]
    PassThrough,
    /// Rasterize and OCR every page anyway, replacing any existing text.
    Reprocess,
}

impl AlreadyHasTextPolicy {
    /// Parse from a form field or query parameter, ignoring case.
    pub fn parse(s: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(s.trim(), true)
            .map_err(|_| anyhow!("unknown already-has-text policy {:?}", s))
    }
}

/// One request to add a text layer to a document. Immutable once built.
#[derive(Debug)]
pub struct RecognitionRequest {
    /// The document to process.
    pub document: Document,

    /// Languages to recognize. Empty means "use the configured default".
    pub languages: Vec<Language>,

    /// Leave pages that already have text alone, and OCR only the rest.
    pub skip_text: bool,

    /// Override the configured [`AlreadyHasTextPolicy`] for this request.
    pub already_has_text: Option<AlreadyHasTextPolicy>,
}

impl RecognitionRequest {
    /// A request using the configured defaults for everything.
    pub fn new(document: Document) -> Self {
        Self {
            document,
            languages: vec![],
            skip_text: false,
            already_has_text: None,
        }
    }
}
