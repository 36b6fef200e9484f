use thiserror::Error;

use crate::models::{Document, DocumentStatus, EntityKind, ExtractedData};
use crate::utils::{format_decimal, now_rfc3339};

/// Failure reason stored when a document is sent to OCR but no engine has a
/// usable credential.
pub const NO_ENGINE_REASON: &str = "no OCR engine configured";

/// An illegal lifecycle transition. These are usage errors, surfaced to the
/// caller with both sides of the conflict, never silently absorbed.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("document {id} is {current}, cannot {attempted}")]
    Conflict {
        id: String,
        current: DocumentStatus,
        attempted: &'static str,
    },
}

fn conflict(document: &Document, attempted: &'static str) -> StateError {
    StateError::Conflict {
        id: document.id.clone(),
        current: document.status,
        attempted,
    }
}

/// `created` → `processed`: OCR succeeded, extracted fields move onto the
/// document. Pure; the caller persists the returned value.
pub fn mark_processed(
    mut document: Document,
    data: &ExtractedData,
) -> Result<Document, StateError> {
    if document.status != DocumentStatus::Created {
        return Err(conflict(&document, "mark processed"));
    }
    document.status = DocumentStatus::Processed;
    document.provider = data.provider.clone();
    document.amount = data.amount.map(format_decimal);
    document.document_date = data.date.clone();
    document.currency = data.currency.clone();
    document.failure_reason = None;
    document.updated_at = now_rfc3339();
    Ok(document)
}

/// `created` → `failed`: OCR failed (or no engine was available); the reason
/// is kept for the retry UI.
pub fn mark_failed(mut document: Document, reason: &str) -> Result<Document, StateError> {
    if document.status != DocumentStatus::Created {
        return Err(conflict(&document, "mark failed"));
    }
    document.status = DocumentStatus::Failed;
    document.failure_reason = Some(reason.to_string());
    document.updated_at = now_rfc3339();
    Ok(document)
}

/// `failed` → `created`: user-triggered retry. Clears the failure reason and
/// any partially extracted data so the next OCR pass starts clean.
pub fn retry(mut document: Document) -> Result<Document, StateError> {
    if document.status != DocumentStatus::Failed {
        return Err(conflict(&document, "retry"));
    }
    document.status = DocumentStatus::Created;
    document.failure_reason = None;
    document.provider = None;
    document.amount = None;
    document.document_date = None;
    document.currency = None;
    document.updated_at = now_rfc3339();
    Ok(document)
}

/// `processed` → `approved`: the document is retired behind the bill or
/// receipt created from it. The SQL layer re-checks this with a
/// compare-and-swap; this function is the value-level counterpart.
pub fn approve(
    mut document: Document,
    kind: EntityKind,
    entity_id: &str,
) -> Result<Document, StateError> {
    if document.status != DocumentStatus::Processed {
        return Err(conflict(&document, "approve"));
    }
    document.status = DocumentStatus::Approved;
    document.linked_entity_kind = Some(kind);
    document.linked_entity_id = Some(entity_id.to_string());
    document.updated_at = now_rfc3339();
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(status: DocumentStatus) -> Document {
        let now = now_rfc3339();
        Document {
            id: "d1".to_string(),
            original_filename: "invoice.pdf".to_string(),
            stored_path: "/storage/2024-03-01-invoice.pdf".to_string(),
            content_hash: "h1".to_string(),
            upload_timestamp: now.clone(),
            status,
            provider: None,
            amount: None,
            document_date: None,
            currency: None,
            failure_reason: None,
            linked_entity_kind: None,
            linked_entity_id: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    fn extracted() -> ExtractedData {
        ExtractedData {
            provider: Some("Acme".to_string()),
            amount: Some(42.5),
            date: Some("2024-03-01".to_string()),
            currency: Some("USD".to_string()),
        }
    }

    #[test]
    fn created_document_can_be_processed() {
        let doc = mark_processed(document(DocumentStatus::Created), &extracted()).unwrap();
        assert_eq!(doc.status, DocumentStatus::Processed);
        assert_eq!(doc.provider.as_deref(), Some("Acme"));
        assert_eq!(doc.amount.as_deref(), Some("42.50"));
        assert_eq!(doc.document_date.as_deref(), Some("2024-03-01"));
        assert_eq!(doc.currency.as_deref(), Some("USD"));
    }

    #[test]
    fn created_document_can_fail() {
        let doc = mark_failed(document(DocumentStatus::Created), "provider unreachable").unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.failure_reason.as_deref(), Some("provider unreachable"));
    }

    #[test]
    fn processing_a_processed_document_is_a_conflict() {
        let err = mark_processed(document(DocumentStatus::Processed), &extracted()).unwrap_err();
        let StateError::Conflict { current, attempted, .. } = err;
        assert_eq!(current, DocumentStatus::Processed);
        assert_eq!(attempted, "mark processed");
    }

    #[test]
    fn retry_resets_failure_state() {
        let mut failed = document(DocumentStatus::Failed);
        failed.failure_reason = Some("timeout".to_string());
        failed.provider = Some("Acme".to_string());
        failed.amount = Some("1.00".to_string());

        let doc = retry(failed).unwrap();
        assert_eq!(doc.status, DocumentStatus::Created);
        assert!(doc.failure_reason.is_none());
        assert!(doc.provider.is_none());
        assert!(doc.amount.is_none());
    }

    #[test]
    fn retry_requires_failed_state() {
        assert!(retry(document(DocumentStatus::Created)).is_err());
        assert!(retry(document(DocumentStatus::Approved)).is_err());
    }

    #[test]
    fn approve_attaches_entity_link() {
        let doc = approve(document(DocumentStatus::Processed), EntityKind::Bill, "b1").unwrap();
        assert_eq!(doc.status, DocumentStatus::Approved);
        assert_eq!(doc.linked_entity_kind, Some(EntityKind::Bill));
        assert_eq!(doc.linked_entity_id.as_deref(), Some("b1"));
    }

    #[test]
    fn approving_a_created_document_names_both_states() {
        let err = approve(document(DocumentStatus::Created), EntityKind::Bill, "b1").unwrap_err();
        assert!(err.to_string().contains("created"));
        assert!(err.to_string().contains("approve"));
    }

    #[test]
    fn approved_is_terminal() {
        assert!(mark_processed(document(DocumentStatus::Approved), &extracted()).is_err());
        assert!(mark_failed(document(DocumentStatus::Approved), "x").is_err());
        assert!(retry(document(DocumentStatus::Approved)).is_err());
        assert!(approve(document(DocumentStatus::Approved), EntityKind::Bill, "b1").is_err());
    }
}
