use anyhow::{anyhow, Result};
use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::db::Database;
use crate::models::{
    AttemptStatus, Document, DocumentStatus, EntityKind, ExtractedData, OcrAttempt, Settings,
};
use crate::services::crypto::CryptoService;
use crate::services::lifecycle::{self, StateError, NO_ENGINE_REASON};
use crate::utils::{normalize_date, now_rfc3339};

mod gemini;
mod openai;

pub use gemini::GeminiVision;
pub use openai::OpenAiVision;

/// Upstream bodies are kept for audit but bounded: a misbehaving provider
/// must not balloon the attempt table.
const MAX_RAW_RESPONSE_LEN: usize = 16 * 1024;

/// Network budget for one provider call. A stuck provider surfaces as a
/// failed attempt, never as an unbounded hang.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Prompt shared by all vision providers. Providers may still wrap the JSON
/// in prose; `find_json_span` digs it back out.
const EXTRACTION_PROMPT: &str = "\
You are a bill and receipt extraction system. Read the attached scanned document \
and answer with a single JSON object, nothing else, exactly in this shape:
{\"provider\": string|null, \"amount\": number|null, \"date\": \"YYYY-MM-DD\"|null, \"currency\": string|null}
provider is the issuing company's name, amount is the grand total as a number, \
date is the document date, currency is the ISO 4217 code. \
Use null for anything you cannot read.";

/// Uniform contract over external vision/OCR back-ends. Calls are total:
/// every network, parsing, or configuration problem comes back as an
/// [`OcrOutcome::Failure`], never as a panic or error.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the engine has a usable credential. A blank credential or the
    /// sample-config placeholder means not configured.
    fn is_available(&self) -> bool;

    async fn extract(&self, file_bytes: &[u8]) -> OcrResult;
}

#[derive(Debug, Clone)]
pub struct OcrResult {
    pub engine: String,
    pub duration_ms: u64,
    pub outcome: OcrOutcome,
}

#[derive(Debug, Clone)]
pub enum OcrOutcome {
    Success {
        data: ExtractedData,
        raw_response: String,
    },
    Failure {
        message: String,
        raw_response: Option<String>,
    },
}

impl OcrResult {
    pub fn success(engine: &str, data: ExtractedData, raw_response: String, duration_ms: u64) -> Self {
        OcrResult {
            engine: engine.to_string(),
            duration_ms,
            outcome: OcrOutcome::Success {
                data,
                raw_response: truncate_raw(raw_response),
            },
        }
    }

    pub fn failure(
        engine: &str,
        message: impl Into<String>,
        raw_response: Option<String>,
        duration_ms: u64,
    ) -> Self {
        OcrResult {
            engine: engine.to_string(),
            duration_ms,
            outcome: OcrOutcome::Failure {
                message: message.into(),
                raw_response: raw_response.map(truncate_raw),
            },
        }
    }
}

/// Build the provider registry in configured priority order. Engines with
/// no usable credential are still registered; the orchestrator skips them
/// via `is_available`.
pub fn build_engines(settings: &Settings) -> Vec<Arc<dyn OcrEngine>> {
    vec![
        Arc::new(OpenAiVision::new(decrypt_credential(
            settings.openai_api_key.as_deref(),
        ))),
        Arc::new(GeminiVision::new(decrypt_credential(
            settings.gemini_api_key.as_deref(),
        ))),
    ]
}

fn decrypt_credential(stored: Option<&str>) -> Option<String> {
    let stored = stored?;
    match CryptoService::decrypt_credential(stored) {
        Ok(credential) => Some(credential),
        Err(e) => {
            tracing::warn!(error = %e, "Could not decrypt provider credential; treating provider as unavailable");
            None
        }
    }
}

/// Run OCR for a document in `created` state and persist the outcome.
///
/// Exactly one engine is tried per invocation, the first available one.
/// On return the document is `processed` or `failed`, with one attempt row
/// recorded when (and only when) a provider was actually called. Calling
/// this on a document in any other state is a usage error.
pub async fn process_document(
    db: &Arc<Mutex<Database>>,
    engines: &[Arc<dyn OcrEngine>],
    document: Document,
) -> Result<Document> {
    if document.status != DocumentStatus::Created {
        return Err(StateError::Conflict {
            id: document.id.clone(),
            current: document.status,
            attempted: "run OCR",
        }
        .into());
    }

    let engine = match engines.iter().find(|e| e.is_available()) {
        Some(engine) => engine,
        None => {
            tracing::warn!(document_id = %document.id, "No OCR engine configured");
            let failed = lifecycle::mark_failed(document, NO_ENGINE_REASON)?;
            let db = db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
            db.update_document(&failed)?;
            return Ok(failed);
        }
    };

    let bytes = match std::fs::read(&document.stored_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            // Stored file unreadable: no provider was called, so no attempt
            // row either.
            let reason = format!("stored file unreadable: {}", e);
            tracing::warn!(document_id = %document.id, error = %e, "Skipping OCR, stored file unreadable");
            let failed = lifecycle::mark_failed(document, &reason)?;
            let db = db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
            db.update_document(&failed)?;
            return Ok(failed);
        }
    };

    tracing::info!(
        document_id = %document.id,
        engine = engine.name(),
        size = bytes.len(),
        "Running OCR"
    );
    let result = engine.extract(&bytes).await;

    let (updated, attempt) = match result.outcome {
        OcrOutcome::Success { data, raw_response } => {
            tracing::info!(
                document_id = %document.id,
                engine = %result.engine,
                elapsed_ms = result.duration_ms,
                "OCR extraction succeeded"
            );
            let attempt = OcrAttempt {
                id: uuid::Uuid::new_v4().to_string(),
                entity_kind: EntityKind::Document,
                entity_id: document.id.clone(),
                timestamp: now_rfc3339(),
                engine_used: result.engine.clone(),
                status: AttemptStatus::Success,
                extracted_json: Some(serde_json::to_string(&data)?),
                error_message: None,
                raw_response: Some(raw_response),
            };
            (lifecycle::mark_processed(document, &data)?, attempt)
        }
        OcrOutcome::Failure { message, raw_response } => {
            tracing::warn!(
                document_id = %document.id,
                engine = %result.engine,
                elapsed_ms = result.duration_ms,
                error = %message,
                "OCR extraction failed"
            );
            let attempt = OcrAttempt {
                id: uuid::Uuid::new_v4().to_string(),
                entity_kind: EntityKind::Document,
                entity_id: document.id.clone(),
                timestamp: now_rfc3339(),
                engine_used: result.engine.clone(),
                status: AttemptStatus::Failed,
                extracted_json: None,
                error_message: Some(message.clone()),
                raw_response,
            };
            (lifecycle::mark_failed(document, &message)?, attempt)
        }
    };

    {
        let mut db = db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
        db.record_ocr_outcome(&updated, &attempt)?;
    }

    Ok(updated)
}

/// Whether a configured credential actually enables the provider.
pub(crate) fn credential_enables(credential: Option<&str>, placeholder: &str) -> bool {
    match credential {
        Some(value) => {
            let trimmed = value.trim();
            !trimmed.is_empty() && trimmed != placeholder
        }
        None => false,
    }
}

/// Pull the structured payload out of a provider's free-text answer:
/// locate the outermost `{...}` span, parse it, check it against the fixed
/// extraction schema, and normalize the date.
pub(crate) fn parse_extraction(answer: &str) -> Result<ExtractedData, String> {
    let span = find_json_span(answer).ok_or_else(|| "no JSON object in answer".to_string())?;
    let value: Value =
        serde_json::from_str(span).map_err(|e| format!("malformed JSON in answer: {}", e))?;

    let schema = extraction_schema();
    if !schema.is_valid(&value) {
        return Err("answer JSON does not match the extraction schema".to_string());
    }

    let raw: ExtractedData =
        serde_json::from_value(value).map_err(|e| format!("unexpected field types: {}", e))?;
    Ok(ExtractedData {
        provider: raw.provider.filter(|p| !p.trim().is_empty()),
        amount: raw.amount,
        date: normalize_date(raw.date),
        currency: raw.currency.filter(|c| !c.trim().is_empty()),
    })
}

fn extraction_schema() -> JSONSchema {
    let schema = json!({
        "type": "object",
        "required": ["provider", "amount", "date", "currency"],
        "properties": {
            "provider": {"type": ["string", "null"]},
            "amount": {"type": ["number", "null"]},
            "date": {"type": ["string", "null"]},
            "currency": {"type": ["string", "null"]}
        }
    });
    JSONSchema::compile(&schema).expect("Invalid JSON schema")
}

/// Find the outermost brace-delimited span in possibly-prose text. Tracks
/// string literals and escapes so braces inside values don't end the span
/// early.
pub(crate) fn find_json_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Bound an upstream body for storage, respecting char boundaries.
pub(crate) fn truncate_raw(mut body: String) -> String {
    if body.len() <= MAX_RAW_RESPONSE_LEN {
        return body;
    }
    let mut cut = MAX_RAW_RESPONSE_LEN;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    body
}

/// Magic-byte sniff for the data-URL MIME type sent to vision providers.
pub(crate) fn sniff_mime(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if bytes.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if bytes.starts_with(b"%PDF") {
        "application/pdf"
    } else if bytes.starts_with(b"II*\x00") || bytes.starts_with(b"MM\x00*") {
        "image/tiff"
    } else if bytes.starts_with(b"BM") {
        "image/bmp"
    } else {
        "image/jpeg"
    }
}

pub(crate) fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
