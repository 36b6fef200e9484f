use anyhow::{anyhow, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::db::Database;
use crate::models::{Document, DocumentStatus};
use crate::services::ocr::{self, OcrEngine};
use crate::services::storage::{build_storage_path, move_into_storage};
use crate::utils::{now_rfc3339, sha256_file};

/// Drive one discovered inbox file through the pipeline: checksum → dedup →
/// storage placement → document creation → OCR. Returns `None` when the file
/// was a duplicate (the dropped copy stays in the inbox; deleting user files
/// is not this code's call).
///
/// On return the new document is `processed` or `failed`, never mid-state.
pub async fn ingest_file(
    db: &Arc<Mutex<Database>>,
    engines: &[Arc<dyn OcrEngine>],
    path: &Path,
    storage_root: &Path,
) -> Result<Option<Document>> {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("unusable filename: {}", path.display()))?
        .to_string();

    let content_hash = sha256_file(path)?;

    let already_known = {
        let db = db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
        db.find_document_by_hash(&content_hash)?.is_some()
    };
    if already_known {
        tracing::info!(file = %filename, hash = %content_hash, "Duplicate content, skipping");
        return Ok(None);
    }

    let now = now_rfc3339();
    let upload_date = Utc::now().format("%Y-%m-%d").to_string();
    let destination = build_storage_path(storage_root, &upload_date, &filename)?;

    let document = Document {
        id: uuid::Uuid::new_v4().to_string(),
        original_filename: filename.clone(),
        stored_path: destination.to_string_lossy().to_string(),
        content_hash: content_hash.clone(),
        upload_timestamp: now.clone(),
        status: DocumentStatus::Created,
        provider: None,
        amount: None,
        document_date: None,
        currency: None,
        failure_reason: None,
        linked_entity_kind: None,
        linked_entity_id: None,
        created_at: now.clone(),
        updated_at: now,
    };

    // The row is claimed before the file moves, so a losing duplicate race
    // ends here with the file still sitting in the inbox.
    {
        let db = db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
        if let Err(e) = db.insert_document(&document) {
            // Two copies of the same file in one batch can both pass the
            // lookup above; the UNIQUE(content_hash) constraint decides.
            if is_unique_violation(&e) {
                tracing::info!(file = %filename, hash = %content_hash, "Duplicate content (insert race), skipping");
                return Ok(None);
            }
            return Err(e.into());
        }
    }

    if let Err(e) = move_into_storage(path, &destination) {
        // Undo the claim so the next scan can pick the file up again.
        let db = db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
        db.delete_document(&document.id)?;
        return Err(e.into());
    }
    tracing::info!(document_id = %document.id, file = %filename, "Document ingested");

    let processed = ocr::process_document(db, engines, document).await?;
    Ok(Some(processed))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_is_recognized() {
        let db = Database::open_in_memory().unwrap();
        let now = now_rfc3339();
        let doc = Document {
            id: "d1".to_string(),
            original_filename: "a.pdf".to_string(),
            stored_path: "/s/a.pdf".to_string(),
            content_hash: "h1".to_string(),
            upload_timestamp: now.clone(),
            status: DocumentStatus::Created,
            provider: None,
            amount: None,
            document_date: None,
            currency: None,
            failure_reason: None,
            linked_entity_kind: None,
            linked_entity_id: None,
            created_at: now.clone(),
            updated_at: now,
        };
        db.insert_document(&doc).unwrap();

        let mut twin = doc.clone();
        twin.id = "d2".to_string();
        let err = db.insert_document(&twin).unwrap_err();
        assert!(is_unique_violation(&err));
    }
}
