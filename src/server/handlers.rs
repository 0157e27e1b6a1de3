//! Request handlers.

use axum::{
    Json,
    body::Body,
    extract::{FromRequest as _, Multipart, Query, Request, State, multipart::Field},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use futures::StreamExt as _;
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    language::Language,
    pipeline::{
        FailureKind, PipelineError, RecognizedDocument,
        request::{AlreadyHasTextPolicy, Document, RecognitionRequest, is_pdf_content_type},
    },
    prelude::*,
};

use super::AppState;

/// Seconds a client should wait before retrying after a queue timeout.
const RETRY_AFTER_SECS: u64 = 10;

/// Slack allowed for multipart framing and text fields on top of the file.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

/// Largest text field we accept in a multipart form.
const MAX_TEXT_FIELD_BYTES: usize = 1024;

/// The browser upload page. `__MAX_BYTES__` and `__LANGUAGE_OPTIONS__` are
/// filled in per request.
const UPLOAD_PAGE: &str = include_str!("upload.html");

/// The upload page needs its own inline styles and script. Everything else
/// gets the stricter policy set by the router.
const UPLOAD_PAGE_CSP: &str = "default-src 'self'; style-src 'self' 'unsafe-inline'; \
     script-src 'self' 'unsafe-inline'; base-uri 'none'; frame-ancestors 'none'";

const X_JOB_ID: HeaderName = HeaderName::from_static("x-job-id");
const X_OCR_USED: HeaderName = HeaderName::from_static("x-ocr-used");
const X_PAGES: HeaderName = HeaderName::from_static("x-pages");

/// JSON body of every failed `/ocr` request.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct FailureBody {
    /// What kind of failure this was.
    pub kind: FailureKind,
    /// A human-readable explanation, possibly including OCR tool output.
    pub detail: String,
    /// The job ID, if a job was started.
    pub job_id: Option<String>,
}

/// JSON body of `GET /health`.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct HealthStatus {
    pub ok: bool,
    /// Maximum number of documents OCRed at once.
    pub workers: usize,
    /// Workers currently idle.
    pub available_slots: usize,
    /// Jobs currently holding scratch files.
    pub live_scopes: usize,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    let gate = state.orchestrator.gate();
    Json(HealthStatus {
        ok: true,
        workers: gate.capacity(),
        available_slots: gate.available(),
        live_scopes: state.orchestrator.store().stats().live,
    })
}

/// `GET /`
pub async fn index(State(state): State<AppState>) -> Response {
    let settings = state.orchestrator.settings();
    let page = UPLOAD_PAGE
        .replace("__MAX_BYTES__", &settings.max_document_bytes.to_string())
        .replace(
            "__LANGUAGE_OPTIONS__",
            &language_options(&settings.supported_languages, &settings.default_languages),
        );
    (
        [(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(UPLOAD_PAGE_CSP),
        )],
        Html(page),
    )
        .into_response()
}

/// `<option>`s for each supported language, plus one for all of them
/// together. The default languages are preselected.
fn language_options(supported: &[Language], defaults: &[Language]) -> String {
    let mut choices = supported
        .iter()
        .map(|&language| (vec![language], language.name().to_owned()))
        .collect::<Vec<_>>();
    if supported.len() > 1 {
        let names = supported.iter().map(|l| l.name()).collect::<Vec<_>>();
        choices.push((supported.to_vec(), names.join(" + ")));
    }
    let default_codes = Language::join_codes(defaults);
    choices
        .into_iter()
        .map(|(languages, label)| {
            let codes = Language::join_codes(&languages);
            let selected = if codes == default_codes { " selected" } else { "" };
            format!("<option value=\"{codes}\"{selected}>{label}</option>")
        })
        .collect()
}

/// A failed request, ready to be turned into a response.
#[derive(Debug)]
pub struct ApiFailure {
    status: StatusCode,
    error: PipelineError,
    job_id: Option<Uuid>,
}

impl ApiFailure {
    fn invalid_input(detail: impl Into<String>) -> Self {
        PipelineError::invalid_input(detail).into()
    }

    fn unsupported_media_type(content_type: &str) -> Self {
        Self {
            status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ..Self::invalid_input(format!(
                "expected application/pdf or multipart/form-data, got {:?}",
                content_type
            ))
        }
    }

    fn with_job_id(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

impl From<PipelineError> for ApiFailure {
    fn from(error: PipelineError) -> Self {
        Self {
            status: status_for(error.kind),
            error,
            job_id: None,
        }
    }
}

/// The HTTP status for each kind of failure.
fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::InvalidInput => StatusCode::BAD_REQUEST,
        FailureKind::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        FailureKind::QueueTimeout => StatusCode::SERVICE_UNAVAILABLE,
        FailureKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        FailureKind::ToolFailure => StatusCode::UNPROCESSABLE_ENTITY,
        FailureKind::ResourceExhausted => StatusCode::INSUFFICIENT_STORAGE,
        // nginx's "client closed request". Nobody is listening anyway.
        FailureKind::Cancelled => {
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
        }
        FailureKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let retry = self.error.kind == FailureKind::QueueTimeout;
        let body = Json(FailureBody {
            kind: self.error.kind,
            detail: self.error.detail,
            job_id: self.job_id.map(|id| id.to_string()),
        });
        let mut response = (self.status, body).into_response();
        if let Some(job_id) = self.job_id {
            insert_header(response.headers_mut(), X_JOB_ID, job_id.to_string());
        }
        if retry {
            insert_header(
                response.headers_mut(),
                header::RETRY_AFTER,
                RETRY_AFTER_SECS.to_string(),
            );
        }
        response
    }
}

/// Request options, from the query string or multipart text fields.
#[derive(Debug, Default)]
struct OcrFields {
    languages: Vec<Language>,
    skip_text: bool,
    already_has_text: Option<AlreadyHasTextPolicy>,
    file_name: Option<String>,
}

impl OcrFields {
    fn apply(&mut self, name: &str, value: &str) -> Result<(), ApiFailure> {
        match name {
            "language" | "languages" | "lang" => {
                let languages = Language::parse_list(value)
                    .map_err(|err| ApiFailure::invalid_input(format!("{:#}", err)))?;
                self.languages.extend(languages);
            }
            "skip_text" => self.skip_text = parse_bool(name, value)?,
            "already_has_text" => {
                self.already_has_text = Some(
                    AlreadyHasTextPolicy::parse(value)
                        .map_err(|err| ApiFailure::invalid_input(format!("{:#}", err)))?,
                )
            }
            "filename" => self.file_name = Some(value.to_owned()),
            _ => debug!(field = name, "Ignoring unknown field"),
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ApiFailure> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" | "0" | "false" | "no" | "off" => Ok(false),
        "1" | "true" | "yes" | "on" => Ok(true),
        _ => Err(ApiFailure::invalid_input(format!(
            "{} must be true or false, got {:?}",
            name, value
        ))),
    }
}

/// `POST /ocr`
#[instrument(level = "debug", skip_all)]
pub async fn ocr(State(state): State<AppState>, request: Request) -> Response {
    match ocr_inner(state, request).await {
        Ok(response) => response,
        Err(failure) => failure.into_response(),
    }
}

async fn ocr_inner(state: AppState, request: Request) -> Result<Response, ApiFailure> {
    let max_bytes = state.orchestrator.settings().max_document_bytes;
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let is_multipart = content_type
        .as_deref()
        .is_some_and(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"));

    // Reject oversized uploads before reading them.
    let allowed_body = if is_multipart {
        max_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES)
    } else {
        max_bytes
    };
    if let Some(len) = content_length(request.headers())
        && len > allowed_body
    {
        return Err(PipelineError::payload_too_large(len, max_bytes).into());
    }

    let recognition_request = if is_multipart {
        read_multipart(&state, request, max_bytes).await?
    } else {
        read_raw(request, content_type, max_bytes).await?
    };

    let file_name = recognition_request.document.file_name.clone();
    let handle = state.orchestrator.submit(recognition_request);
    let job_id = handle.job_id();
    // If the client disconnects, hyper drops this future, which drops the
    // handle and cancels the job.
    let report = handle
        .wait()
        .await
        .map_err(|err| ApiFailure::from(PipelineError::internal(&err)).with_job_id(job_id))?;
    match report.result {
        Ok(document) => Ok(success_response(job_id, document, file_name.as_deref())),
        Err(err) => Err(ApiFailure::from(err).with_job_id(job_id)),
    }
}

/// Read a raw PDF body, with options in the query string.
async fn read_raw(
    request: Request,
    content_type: Option<String>,
    max_bytes: usize,
) -> Result<RecognitionRequest, ApiFailure> {
    if let Some(content_type) = &content_type
        && !is_pdf_content_type(content_type)
    {
        return Err(ApiFailure::unsupported_media_type(content_type));
    }

    // A list of pairs, because `language` may be repeated.
    let Query(params) = Query::<Vec<(String, String)>>::try_from_uri(request.uri())
        .map_err(|err| ApiFailure::invalid_input(format!("invalid query string: {}", err)))?;
    let mut fields = OcrFields::default();
    for (name, value) in &params {
        fields.apply(name, value)?;
    }

    let bytes = read_limited(request.into_body(), max_bytes).await?;
    let document = Document {
        bytes,
        content_type,
        file_name: fields.file_name.take(),
    };
    Ok(build_request(document, fields))
}

/// Read a multipart form with a `file` field and optional text fields.
async fn read_multipart(
    state: &AppState,
    request: Request,
    max_bytes: usize,
) -> Result<RecognitionRequest, ApiFailure> {
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|rejection| ApiFailure::invalid_input(rejection.body_text()))?;

    let mut fields = OcrFields::default();
    let mut document = None;
    while let Some(field) = multipart.next_field().await.map_err(|err| {
        ApiFailure::invalid_input(format!("invalid multipart body: {}", err.body_text()))
    })? {
        let name = field.name().unwrap_or_default().to_owned();
        if name == "file" {
            if document.is_some() {
                return Err(ApiFailure::invalid_input("expected exactly one file"));
            }
            let file_name = field.file_name().map(str::to_owned);
            let content_type = field.content_type().map(str::to_owned);
            if let Some(content_type) = &content_type
                && !is_pdf_content_type(content_type)
            {
                return Err(ApiFailure::unsupported_media_type(content_type));
            }
            let bytes = read_field(field, max_bytes).await?;
            document = Some(Document {
                bytes,
                content_type,
                file_name,
            });
        } else {
            let bytes = read_field(field, MAX_TEXT_FIELD_BYTES)
                .await
                .map_err(|failure| {
                    if failure.error.kind == FailureKind::PayloadTooLarge {
                        ApiFailure::invalid_input(format!("field {:?} is too long", name))
                    } else {
                        failure
                    }
                })?;
            let value = String::from_utf8(bytes).map_err(|_| {
                ApiFailure::invalid_input(format!("field {:?} is not valid UTF-8", name))
            })?;
            fields.apply(&name, &value)?;
        }
    }

    let mut document =
        document.ok_or_else(|| ApiFailure::invalid_input("missing \"file\" field"))?;
    if let Some(file_name) = fields.file_name.take() {
        document.file_name = Some(file_name);
    }
    Ok(build_request(document, fields))
}

fn build_request(document: Document, fields: OcrFields) -> RecognitionRequest {
    RecognitionRequest {
        languages: fields.languages,
        skip_text: fields.skip_text,
        already_has_text: fields.already_has_text,
        ..RecognitionRequest::new(document)
    }
}

/// Read a whole body, failing as soon as it passes `max_bytes`.
async fn read_limited(body: Body, max_bytes: usize) -> Result<Vec<u8>, ApiFailure> {
    let mut stream = body.into_data_stream();
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| {
            ApiFailure::invalid_input(format!("failed to read request body: {}", err))
        })?;
        let len = bytes.len().saturating_add(chunk.len());
        if len > max_bytes {
            return Err(PipelineError::payload_too_large(len, max_bytes).into());
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Read one multipart field, failing as soon as it passes `max_bytes`.
async fn read_field(mut field: Field<'_>, max_bytes: usize) -> Result<Vec<u8>, ApiFailure> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await.map_err(|err| {
        ApiFailure::invalid_input(format!("invalid multipart body: {}", err.body_text()))
    })? {
        let len = bytes.len().saturating_add(chunk.len());
        if len > max_bytes {
            return Err(PipelineError::payload_too_large(len, max_bytes).into());
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

fn success_response(
    job_id: Uuid,
    document: RecognizedDocument,
    file_name: Option<&str>,
) -> Response {
    let mut response = document.bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/pdf"),
    );
    insert_header(
        headers,
        header::CONTENT_DISPOSITION,
        format!("attachment; filename=\"{}\"", download_name(file_name)),
    );
    insert_header(headers, X_JOB_ID, job_id.to_string());
    headers.insert(
        X_OCR_USED,
        HeaderValue::from_static(if document.ocr_applied { "1" } else { "0" }),
    );
    if let Some(pages) = document.page_count {
        insert_header(headers, X_PAGES, pages.to_string());
    }
    response
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: String) {
    match HeaderValue::try_from(value) {
        Ok(value) => {
            headers.insert(name, value);
        }
        Err(err) => warn!(header = %name, "invalid header value: {}", err),
    }
}

/// Build a safe download name like `scan.ocr.pdf` from a client-supplied
/// file name.
fn download_name(file_name: Option<&str>) -> String {
    let base = file_name
        .and_then(|name| name.rsplit(['/', '\\']).next())
        .unwrap_or_default();
    let stem = match base.len().checked_sub(4) {
        Some(i) if base.is_char_boundary(i) && base[i..].eq_ignore_ascii_case(".pdf") => {
            &base[..i]
        }
        _ => base,
    };
    let cleaned = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect::<String>();
    let cleaned = cleaned.trim_matches(['.', '_']);
    if cleaned.is_empty() {
        "document.ocr.pdf".to_owned()
    } else {
        format!("{}.ocr.pdf", cleaned)
    }
}
