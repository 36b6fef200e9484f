use rusqlite::{params, OptionalExtension, Result as SqlResult, Row};

use super::documents::update_document_row;
use super::Database;
use crate::models::{Document, EntityKind, OcrAttempt};

const ATTEMPT_COLUMNS: &str = "id, entity_kind, entity_id, timestamp, engine_used, status, \
     extracted_json, error_message, raw_response";

/// Connection-level insert so it can also run inside a transaction.
pub(crate) fn insert_attempt_row(
    conn: &rusqlite::Connection,
    attempt: &OcrAttempt,
) -> SqlResult<()> {
    conn.execute(
        "INSERT INTO ocr_attempts (
            id, entity_kind, entity_id, timestamp, engine_used, status,
            extracted_json, error_message, raw_response
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            attempt.id,
            attempt.entity_kind,
            attempt.entity_id,
            attempt.timestamp,
            attempt.engine_used,
            attempt.status,
            attempt.extracted_json,
            attempt.error_message,
            attempt.raw_response
        ],
    )?;
    Ok(())
}

fn map_attempt(row: &Row<'_>) -> SqlResult<OcrAttempt> {
    Ok(OcrAttempt {
        id: row.get(0)?,
        entity_kind: row.get(1)?,
        entity_id: row.get(2)?,
        timestamp: row.get(3)?,
        engine_used: row.get(4)?,
        status: row.get(5)?,
        extracted_json: row.get(6)?,
        error_message: row.get(7)?,
        raw_response: row.get(8)?,
    })
}

impl Database {
    /// Append one attempt record. Attempts are written exactly once per OCR
    /// invocation and never updated afterwards; the only removal path is
    /// [`Database::purge_attempts_for_entity`] on permanent entity deletion.
    pub fn insert_attempt(&self, attempt: &OcrAttempt) -> SqlResult<()> {
        insert_attempt_row(&self.conn, attempt)
    }

    /// Persist an OCR outcome: the document's new state and the attempt that
    /// produced it land in one transaction, so the document can never show
    /// `processed` or `failed` without the matching audit row.
    pub fn record_ocr_outcome(
        &mut self,
        document: &Document,
        attempt: &OcrAttempt,
    ) -> SqlResult<()> {
        let tx = self.conn.transaction()?;
        update_document_row(&tx, document)?;
        insert_attempt_row(&tx, attempt)?;
        tx.commit()
    }

    pub fn attempts_for_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> SqlResult<Vec<OcrAttempt>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM ocr_attempts
             WHERE entity_kind = ?1 AND entity_id = ?2
             ORDER BY timestamp DESC",
            ATTEMPT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![kind, entity_id], map_attempt)?;
        rows.collect()
    }

    pub fn latest_attempt_for_entity(
        &self,
        kind: EntityKind,
        entity_id: &str,
    ) -> SqlResult<Option<OcrAttempt>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM ocr_attempts
             WHERE entity_kind = ?1 AND entity_id = ?2
             ORDER BY timestamp DESC
             LIMIT 1",
            ATTEMPT_COLUMNS
        ))?;
        stmt.query_row(params![kind, entity_id], map_attempt)
            .optional()
    }

    /// Bulk-delete attempt history when its entity is permanently removed,
    /// so no orphaned audit rows are left behind. Not called on conversion;
    /// conversion re-points the rows instead.
    pub fn purge_attempts_for_entity(&self, kind: EntityKind, entity_id: &str) -> SqlResult<usize> {
        self.conn.execute(
            "DELETE FROM ocr_attempts WHERE entity_kind = ?1 AND entity_id = ?2",
            params![kind, entity_id],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptStatus, DocumentStatus};
    use crate::utils::now_rfc3339;

    fn attempt(id: &str, kind: EntityKind, entity_id: &str, timestamp: &str) -> OcrAttempt {
        OcrAttempt {
            id: id.to_string(),
            entity_kind: kind,
            entity_id: entity_id.to_string(),
            timestamp: timestamp.to_string(),
            engine_used: "openai-vision".to_string(),
            status: AttemptStatus::Success,
            extracted_json: Some("{\"amount\":42.5}".to_string()),
            error_message: None,
            raw_response: Some("raw".to_string()),
        }
    }

    #[test]
    fn attempts_ordered_newest_first() {
        let db = Database::open_in_memory().unwrap();
        db.insert_attempt(&attempt("a1", EntityKind::Document, "d1", "2024-03-01T10:00:00Z"))
            .unwrap();
        db.insert_attempt(&attempt("a2", EntityKind::Document, "d1", "2024-03-02T10:00:00Z"))
            .unwrap();

        let history = db.attempts_for_entity(EntityKind::Document, "d1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, "a2");
        assert_eq!(history[1].id, "a1");

        let latest = db
            .latest_attempt_for_entity(EntityKind::Document, "d1")
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, "a2");
    }

    #[test]
    fn history_is_scoped_to_the_entity_reference() {
        let db = Database::open_in_memory().unwrap();
        db.insert_attempt(&attempt("a1", EntityKind::Document, "d1", &now_rfc3339()))
            .unwrap();
        db.insert_attempt(&attempt("a2", EntityKind::Bill, "d1", &now_rfc3339()))
            .unwrap();

        assert_eq!(db.attempts_for_entity(EntityKind::Document, "d1").unwrap().len(), 1);
        assert_eq!(db.attempts_for_entity(EntityKind::Bill, "d1").unwrap().len(), 1);
        assert!(db
            .latest_attempt_for_entity(EntityKind::Receipt, "d1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn outcome_write_is_all_or_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        let now = now_rfc3339();
        let mut doc = Document {
            id: "d1".to_string(),
            original_filename: "invoice.pdf".to_string(),
            stored_path: "/storage/2024-03-01-invoice.pdf".to_string(),
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
            updated_at: now.clone(),
        };
        db.insert_document(&doc).unwrap();
        db.insert_attempt(&attempt("a1", EntityKind::Document, "d1", &now))
            .unwrap();

        // A clashing attempt id aborts the whole write: the document must
        // still read as created.
        doc.status = DocumentStatus::Processed;
        let clash = attempt("a1", EntityKind::Document, "d1", &now);
        assert!(db.record_ocr_outcome(&doc, &clash).is_err());
        assert_eq!(
            db.get_document_by_id("d1").unwrap().unwrap().status,
            DocumentStatus::Created
        );
        assert_eq!(db.attempts_for_entity(EntityKind::Document, "d1").unwrap().len(), 1);

        let fresh = attempt("a2", EntityKind::Document, "d1", &now);
        db.record_ocr_outcome(&doc, &fresh).unwrap();
        assert_eq!(
            db.get_document_by_id("d1").unwrap().unwrap().status,
            DocumentStatus::Processed
        );
        assert_eq!(db.attempts_for_entity(EntityKind::Document, "d1").unwrap().len(), 2);
    }

    #[test]
    fn purge_removes_only_the_targeted_entity() {
        let db = Database::open_in_memory().unwrap();
        db.insert_attempt(&attempt("a1", EntityKind::Document, "d1", &now_rfc3339()))
            .unwrap();
        db.insert_attempt(&attempt("a2", EntityKind::Document, "d1", &now_rfc3339()))
            .unwrap();
        db.insert_attempt(&attempt("a3", EntityKind::Document, "d2", &now_rfc3339()))
            .unwrap();

        let purged = db.purge_attempts_for_entity(EntityKind::Document, "d1").unwrap();
        assert_eq!(purged, 2);
        assert!(db.attempts_for_entity(EntityKind::Document, "d1").unwrap().is_empty());
        assert_eq!(db.attempts_for_entity(EntityKind::Document, "d2").unwrap().len(), 1);
    }
}
