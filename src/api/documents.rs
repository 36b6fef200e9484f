use anyhow::{anyhow, Result};

use crate::models::{Document, DocumentDetail, DocumentStatus, EntityKind, OcrAttempt};
use crate::services::lifecycle;
use crate::services::ocr::{self, build_engines};
use crate::services::state::AppState;

/// Documents filtered by status, or everything still in the ingestion
/// lifecycle (not yet approved) when no filter is given.
pub fn list_documents(state: &AppState, status: Option<DocumentStatus>) -> Result<Vec<Document>> {
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    let documents = match status {
        Some(status) => db.list_documents_by_status(status)?,
        None => db.list_active_documents()?,
    };
    Ok(documents)
}

pub fn get_document_detail(state: &AppState, document_id: &str) -> Result<DocumentDetail> {
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    let document = db
        .get_document_by_id(document_id)?
        .ok_or_else(|| anyhow!("Document not found: {}", document_id))?;
    let latest_attempt = db.latest_attempt_for_entity(EntityKind::Document, document_id)?;
    Ok(DocumentDetail {
        document,
        latest_attempt,
    })
}

pub fn get_attempt_history(
    state: &AppState,
    kind: EntityKind,
    entity_id: &str,
) -> Result<Vec<OcrAttempt>> {
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    Ok(db.attempts_for_entity(kind, entity_id)?)
}

/// Put a failed document back through OCR. The prior attempts stay in the
/// history; only the document's extracted fields and failure reason are
/// cleared before the new run.
pub async fn retry_document(state: &AppState, document_id: &str) -> Result<Document> {
    let reset = {
        let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
        let document = db
            .get_document_by_id(document_id)?
            .ok_or_else(|| anyhow!("Document not found: {}", document_id))?;
        let reset = lifecycle::retry(document)?;
        db.update_document(&reset)?;
        reset
    };

    let settings = state.current_settings()?;
    let engines = build_engines(&settings);
    ocr::process_document(&state.db, &engines, reset).await
}

/// Drop a document and its attempt history. The stored file is left on disk.
/// Approved documents are refused: their record backs a live bill or receipt
/// and keeps the content hash reserved, so they can only leave via revert.
pub fn reject_document(state: &AppState, document_id: &str) -> Result<()> {
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    let document = db
        .get_document_by_id(document_id)?
        .ok_or_else(|| anyhow!("Document not found: {}", document_id))?;
    if document.status == DocumentStatus::Approved {
        return Err(lifecycle::StateError::Conflict {
            id: document.id,
            current: document.status,
            attempted: "reject",
        }
        .into());
    }
    db.purge_attempts_for_entity(EntityKind::Document, document_id)?;
    db.delete_document(document_id)?;
    Ok(())
}
