use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use thiserror::Error;

use super::documents::fetch_document;
use super::Database;
use crate::models::{Bill, Document, DocumentStatus, EntityKind, Receipt};
use crate::utils::now_rfc3339;

/// Why a convert or revert request was refused. Conversions run inside a
/// single transaction; on any error the transaction rolls back whole.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },
    #[error("document {id} is {current}, expected {expected}")]
    StateConflict {
        id: String,
        current: DocumentStatus,
        expected: DocumentStatus,
    },
    #[error("{kind} {id} was created manually and has no source document to restore")]
    ManualEntry { kind: EntityKind, id: String },
    #[error("bill {id} has a dependent receipt and cannot be reverted")]
    DependentReceipt { id: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

const BILL_COLUMNS: &str = "id, original_filename, stored_path, content_hash, upload_timestamp, \
     provider, amount, document_date, currency, original_document_id, created_at, updated_at";

const RECEIPT_COLUMNS: &str = "id, original_filename, stored_path, content_hash, upload_timestamp, \
     provider, amount, document_date, currency, original_document_id, bill_id, \
     created_at, updated_at";

fn map_bill(row: &Row<'_>) -> SqlResult<Bill> {
    Ok(Bill {
        id: row.get(0)?,
        original_filename: row.get(1)?,
        stored_path: row.get(2)?,
        content_hash: row.get(3)?,
        upload_timestamp: row.get(4)?,
        provider: row.get(5)?,
        amount: row.get(6)?,
        document_date: row.get(7)?,
        currency: row.get(8)?,
        original_document_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn map_receipt(row: &Row<'_>) -> SqlResult<Receipt> {
    Ok(Receipt {
        id: row.get(0)?,
        original_filename: row.get(1)?,
        stored_path: row.get(2)?,
        content_hash: row.get(3)?,
        upload_timestamp: row.get(4)?,
        provider: row.get(5)?,
        amount: row.get(6)?,
        document_date: row.get(7)?,
        currency: row.get(8)?,
        original_document_id: row.get(9)?,
        bill_id: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

/// Compare-and-swap the source document into `approved`. Zero rows affected
/// means another conversion won the race (or the document was never
/// processed); the caller turns that into a state conflict and rolls back.
fn retire_document(
    conn: &Connection,
    document: &Document,
    kind: EntityKind,
    entity_id: &str,
    now: &str,
) -> Result<(), ConversionError> {
    let affected = conn.execute(
        "UPDATE documents
         SET status = 'approved', linked_entity_kind = ?2, linked_entity_id = ?3, updated_at = ?4
         WHERE id = ?1 AND status = 'processed'",
        params![document.id, kind, entity_id, now],
    )?;
    if affected == 0 {
        return Err(ConversionError::StateConflict {
            id: document.id.clone(),
            current: document.status,
            expected: DocumentStatus::Processed,
        });
    }
    Ok(())
}

/// Re-point attempt history at the entity's new identity. The rows
/// themselves stay untouched; only the polymorphic reference moves.
fn repoint_attempts(
    conn: &Connection,
    from_kind: EntityKind,
    from_id: &str,
    to_kind: EntityKind,
    to_id: &str,
) -> SqlResult<usize> {
    conn.execute(
        "UPDATE ocr_attempts SET entity_kind = ?3, entity_id = ?4
         WHERE entity_kind = ?1 AND entity_id = ?2",
        params![from_kind, from_id, to_kind, to_id],
    )
}

/// Compare-and-swap an approved document back to `processed`, clearing its
/// entity link. Used by the revert path.
fn reactivate_document(
    conn: &Connection,
    document: &Document,
    now: &str,
) -> Result<(), ConversionError> {
    let affected = conn.execute(
        "UPDATE documents
         SET status = 'processed', linked_entity_kind = NULL, linked_entity_id = NULL, updated_at = ?2
         WHERE id = ?1 AND status = 'approved'",
        params![document.id, now],
    )?;
    if affected == 0 {
        return Err(ConversionError::StateConflict {
            id: document.id.clone(),
            current: document.status,
            expected: DocumentStatus::Approved,
        });
    }
    Ok(())
}

impl Database {
    /// Materialize a bill from a processed document. Creates the bill row,
    /// retires the source document and carries the attempt history over,
    /// all inside one transaction.
    pub fn convert_to_bill(&mut self, document_id: &str) -> Result<Bill, ConversionError> {
        let now = now_rfc3339();
        let bill_id = uuid::Uuid::new_v4().to_string();

        let tx = self.conn.transaction()?;
        let document = fetch_document(&tx, document_id)?.ok_or_else(|| ConversionError::NotFound {
            kind: EntityKind::Document,
            id: document_id.to_string(),
        })?;

        tx.execute(
            "INSERT INTO bills (
                id, original_filename, stored_path, content_hash, upload_timestamp,
                provider, amount, document_date, currency, original_document_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                bill_id,
                document.original_filename,
                document.stored_path,
                document.content_hash,
                document.upload_timestamp,
                document.provider,
                document.amount,
                document.document_date,
                document.currency,
                document.id,
                now,
                now
            ],
        )?;
        retire_document(&tx, &document, EntityKind::Bill, &bill_id, &now)?;
        repoint_attempts(&tx, EntityKind::Document, &document.id, EntityKind::Bill, &bill_id)?;
        tx.commit()?;

        Ok(Bill {
            id: bill_id,
            original_filename: document.original_filename,
            stored_path: Some(document.stored_path),
            content_hash: Some(document.content_hash),
            upload_timestamp: Some(document.upload_timestamp),
            provider: document.provider,
            amount: document.amount,
            document_date: document.document_date,
            currency: document.currency,
            original_document_id: Some(document.id),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn convert_to_receipt(&mut self, document_id: &str) -> Result<Receipt, ConversionError> {
        let now = now_rfc3339();
        let receipt_id = uuid::Uuid::new_v4().to_string();

        let tx = self.conn.transaction()?;
        let document = fetch_document(&tx, document_id)?.ok_or_else(|| ConversionError::NotFound {
            kind: EntityKind::Document,
            id: document_id.to_string(),
        })?;

        tx.execute(
            "INSERT INTO receipts (
                id, original_filename, stored_path, content_hash, upload_timestamp,
                provider, amount, document_date, currency, original_document_id,
                bill_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, ?12)",
            params![
                receipt_id,
                document.original_filename,
                document.stored_path,
                document.content_hash,
                document.upload_timestamp,
                document.provider,
                document.amount,
                document.document_date,
                document.currency,
                document.id,
                now,
                now
            ],
        )?;
        retire_document(&tx, &document, EntityKind::Receipt, &receipt_id, &now)?;
        repoint_attempts(
            &tx,
            EntityKind::Document,
            &document.id,
            EntityKind::Receipt,
            &receipt_id,
        )?;
        tx.commit()?;

        Ok(Receipt {
            id: receipt_id,
            original_filename: document.original_filename,
            stored_path: Some(document.stored_path),
            content_hash: Some(document.content_hash),
            upload_timestamp: Some(document.upload_timestamp),
            provider: document.provider,
            amount: document.amount,
            document_date: document.document_date,
            currency: document.currency,
            original_document_id: Some(document.id),
            bill_id: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Undo a conversion: delete the bill and reactivate its source document
    /// with the attempt history pointed back at it. Refused for manual bills
    /// and for bills a receipt still hangs off of.
    pub fn revert_bill(&mut self, bill_id: &str) -> Result<Document, ConversionError> {
        let now = now_rfc3339();

        let tx = self.conn.transaction()?;
        let bill = {
            let mut stmt =
                tx.prepare(&format!("SELECT {} FROM bills WHERE id = ?1", BILL_COLUMNS))?;
            stmt.query_row(params![bill_id], map_bill).optional()?
        }
        .ok_or_else(|| ConversionError::NotFound {
            kind: EntityKind::Bill,
            id: bill_id.to_string(),
        })?;

        let dependent: Option<String> = tx
            .query_row(
                "SELECT id FROM receipts WHERE bill_id = ?1 LIMIT 1",
                params![bill_id],
                |row| row.get(0),
            )
            .optional()?;
        if dependent.is_some() {
            return Err(ConversionError::DependentReceipt {
                id: bill_id.to_string(),
            });
        }

        let source_id = bill
            .original_document_id
            .as_deref()
            .ok_or_else(|| ConversionError::ManualEntry {
                kind: EntityKind::Bill,
                id: bill_id.to_string(),
            })?;
        let document = fetch_document(&tx, source_id)?.ok_or_else(|| ConversionError::NotFound {
            kind: EntityKind::Document,
            id: source_id.to_string(),
        })?;

        reactivate_document(&tx, &document, &now)?;
        tx.execute("DELETE FROM bills WHERE id = ?1", params![bill_id])?;
        repoint_attempts(&tx, EntityKind::Bill, bill_id, EntityKind::Document, &document.id)?;
        tx.commit()?;

        let mut restored = document;
        restored.status = DocumentStatus::Processed;
        restored.linked_entity_kind = None;
        restored.linked_entity_id = None;
        restored.updated_at = now;
        Ok(restored)
    }

    pub fn revert_receipt(&mut self, receipt_id: &str) -> Result<Document, ConversionError> {
        let now = now_rfc3339();

        let tx = self.conn.transaction()?;
        let receipt = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM receipts WHERE id = ?1",
                RECEIPT_COLUMNS
            ))?;
            stmt.query_row(params![receipt_id], map_receipt).optional()?
        }
        .ok_or_else(|| ConversionError::NotFound {
            kind: EntityKind::Receipt,
            id: receipt_id.to_string(),
        })?;

        let source_id = receipt
            .original_document_id
            .as_deref()
            .ok_or_else(|| ConversionError::ManualEntry {
                kind: EntityKind::Receipt,
                id: receipt_id.to_string(),
            })?;
        let document = fetch_document(&tx, source_id)?.ok_or_else(|| ConversionError::NotFound {
            kind: EntityKind::Document,
            id: source_id.to_string(),
        })?;

        reactivate_document(&tx, &document, &now)?;
        tx.execute("DELETE FROM receipts WHERE id = ?1", params![receipt_id])?;
        repoint_attempts(
            &tx,
            EntityKind::Receipt,
            receipt_id,
            EntityKind::Document,
            &document.id,
        )?;
        tx.commit()?;

        let mut restored = document;
        restored.status = DocumentStatus::Processed;
        restored.linked_entity_kind = None;
        restored.linked_entity_id = None;
        restored.updated_at = now;
        Ok(restored)
    }

    /// Insert a bill entered by hand, outside the conversion flow.
    /// `original_document_id` stays empty so it can never be reverted.
    pub fn insert_bill(&self, bill: &Bill) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO bills (
                id, original_filename, stored_path, content_hash, upload_timestamp,
                provider, amount, document_date, currency, original_document_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                bill.id,
                bill.original_filename,
                bill.stored_path,
                bill.content_hash,
                bill.upload_timestamp,
                bill.provider,
                bill.amount,
                bill.document_date,
                bill.currency,
                bill.original_document_id,
                bill.created_at,
                bill.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn insert_receipt(&self, receipt: &Receipt) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO receipts (
                id, original_filename, stored_path, content_hash, upload_timestamp,
                provider, amount, document_date, currency, original_document_id,
                bill_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                receipt.id,
                receipt.original_filename,
                receipt.stored_path,
                receipt.content_hash,
                receipt.upload_timestamp,
                receipt.provider,
                receipt.amount,
                receipt.document_date,
                receipt.currency,
                receipt.original_document_id,
                receipt.bill_id,
                receipt.created_at,
                receipt.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn get_bill_by_id(&self, id: &str) -> SqlResult<Option<Bill>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM bills WHERE id = ?1", BILL_COLUMNS))?;
        stmt.query_row(params![id], map_bill).optional()
    }

    pub fn get_receipt_by_id(&self, id: &str) -> SqlResult<Option<Receipt>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM receipts WHERE id = ?1",
            RECEIPT_COLUMNS
        ))?;
        stmt.query_row(params![id], map_receipt).optional()
    }

    pub fn list_bills(&self) -> SqlResult<Vec<Bill>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM bills ORDER BY document_date DESC, created_at DESC",
            BILL_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_bill)?;
        rows.collect()
    }

    pub fn list_receipts(&self) -> SqlResult<Vec<Receipt>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM receipts ORDER BY document_date DESC, created_at DESC",
            RECEIPT_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_receipt)?;
        rows.collect()
    }

    pub fn delete_bill(&self, id: &str) -> SqlResult<usize> {
        self.conn.execute("DELETE FROM bills WHERE id = ?1", params![id])
    }

    pub fn delete_receipt(&self, id: &str) -> SqlResult<usize> {
        self.conn.execute("DELETE FROM receipts WHERE id = ?1", params![id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttemptStatus;
    use crate::models::OcrAttempt;

    fn processed_document(db: &Database, id: &str, hash: &str) -> Document {
        let now = now_rfc3339();
        let doc = Document {
            id: id.to_string(),
            original_filename: "invoice.pdf".to_string(),
            stored_path: "/storage/2024-03-01-invoice.pdf".to_string(),
            content_hash: hash.to_string(),
            upload_timestamp: now.clone(),
            status: DocumentStatus::Processed,
            provider: Some("Acme".to_string()),
            amount: Some("42.50".to_string()),
            document_date: Some("2024-03-01".to_string()),
            currency: Some("USD".to_string()),
            failure_reason: None,
            linked_entity_kind: None,
            linked_entity_id: None,
            created_at: now.clone(),
            updated_at: now,
        };
        db.insert_document(&doc).unwrap();
        doc
    }

    fn success_attempt(db: &Database, entity_id: &str) {
        db.insert_attempt(&OcrAttempt {
            id: uuid::Uuid::new_v4().to_string(),
            entity_kind: EntityKind::Document,
            entity_id: entity_id.to_string(),
            timestamp: now_rfc3339(),
            engine_used: "openai-vision".to_string(),
            status: AttemptStatus::Success,
            extracted_json: Some("{}".to_string()),
            error_message: None,
            raw_response: None,
        })
        .unwrap();
    }

    #[test]
    fn conversion_copies_metadata_and_retires_source() {
        let mut db = Database::open_in_memory().unwrap();
        let doc = processed_document(&db, "d1", "h1");
        success_attempt(&db, "d1");

        let bill = db.convert_to_bill("d1").unwrap();
        assert_eq!(bill.original_document_id.as_deref(), Some("d1"));
        assert_eq!(bill.content_hash.as_deref(), Some(doc.content_hash.as_str()));
        assert_eq!(bill.amount.as_deref(), Some("42.50"));

        let retired = db.get_document_by_id("d1").unwrap().unwrap();
        assert_eq!(retired.status, DocumentStatus::Approved);
        assert_eq!(retired.linked_entity_kind, Some(EntityKind::Bill));
        assert_eq!(retired.linked_entity_id.as_deref(), Some(bill.id.as_str()));

        // History now rides on the bill.
        assert!(db.attempts_for_entity(EntityKind::Document, "d1").unwrap().is_empty());
        assert_eq!(db.attempts_for_entity(EntityKind::Bill, &bill.id).unwrap().len(), 1);
    }

    #[test]
    fn second_conversion_of_same_document_is_a_state_conflict() {
        let mut db = Database::open_in_memory().unwrap();
        processed_document(&db, "d1", "h1");

        db.convert_to_bill("d1").unwrap();
        let err = db.convert_to_receipt("d1").unwrap_err();
        assert!(matches!(err, ConversionError::StateConflict { .. }));

        // The failed attempt left no receipt behind.
        assert!(db.list_receipts().unwrap().is_empty());
    }

    #[test]
    fn converting_an_unprocessed_document_is_rejected() {
        let mut db = Database::open_in_memory().unwrap();
        let mut doc = processed_document(&db, "d1", "h1");
        doc.status = DocumentStatus::Created;
        db.update_document(&doc).unwrap();

        let err = db.convert_to_bill("d1").unwrap_err();
        match err {
            ConversionError::StateConflict { current, .. } => {
                assert_eq!(current, DocumentStatus::Created)
            }
            other => panic!("expected state conflict, got {other:?}"),
        }
        assert!(db.list_bills().unwrap().is_empty());
    }

    #[test]
    fn revert_restores_document_and_history() {
        let mut db = Database::open_in_memory().unwrap();
        let original = processed_document(&db, "d1", "h1");
        success_attempt(&db, "d1");

        let bill = db.convert_to_bill("d1").unwrap();
        let restored = db.revert_bill(&bill.id).unwrap();

        assert_eq!(restored.id, "d1");
        assert_eq!(restored.status, DocumentStatus::Processed);
        assert_eq!(restored.content_hash, original.content_hash);
        assert_eq!(restored.original_filename, original.original_filename);
        assert_eq!(restored.upload_timestamp, original.upload_timestamp);
        assert!(restored.linked_entity_id.is_none());

        assert!(db.get_bill_by_id(&bill.id).unwrap().is_none());
        let history = db.attempts_for_entity(EntityKind::Document, "d1").unwrap();
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn reverted_document_accepts_a_fresh_conversion() {
        let mut db = Database::open_in_memory().unwrap();
        processed_document(&db, "d1", "h1");

        let bill = db.convert_to_bill("d1").unwrap();
        db.revert_bill(&bill.id).unwrap();
        let receipt = db.convert_to_receipt("d1").unwrap();
        assert_eq!(receipt.original_document_id.as_deref(), Some("d1"));
    }

    #[test]
    fn manual_bill_cannot_be_reverted() {
        let mut db = Database::open_in_memory().unwrap();
        let now = now_rfc3339();
        db.insert_bill(&Bill {
            id: "b1".to_string(),
            original_filename: "manual.pdf".to_string(),
            stored_path: None,
            content_hash: None,
            upload_timestamp: None,
            provider: Some("Acme".to_string()),
            amount: Some("10.00".to_string()),
            document_date: None,
            currency: Some("EUR".to_string()),
            original_document_id: None,
            created_at: now.clone(),
            updated_at: now,
        })
        .unwrap();

        let err = db.revert_bill("b1").unwrap_err();
        assert!(matches!(err, ConversionError::ManualEntry { .. }));
        assert!(db.get_bill_by_id("b1").unwrap().is_some());
    }

    #[test]
    fn revert_is_refused_while_a_receipt_depends_on_the_bill() {
        let mut db = Database::open_in_memory().unwrap();
        processed_document(&db, "d1", "h1");
        let bill = db.convert_to_bill("d1").unwrap();

        let now = now_rfc3339();
        db.insert_receipt(&Receipt {
            id: "r1".to_string(),
            original_filename: "payment.pdf".to_string(),
            stored_path: None,
            content_hash: None,
            upload_timestamp: None,
            provider: None,
            amount: Some("42.50".to_string()),
            document_date: None,
            currency: None,
            original_document_id: None,
            bill_id: Some(bill.id.clone()),
            created_at: now.clone(),
            updated_at: now,
        })
        .unwrap();

        let err = db.revert_bill(&bill.id).unwrap_err();
        assert!(matches!(err, ConversionError::DependentReceipt { .. }));
        assert!(db.get_bill_by_id(&bill.id).unwrap().is_some());
        assert_eq!(
            db.get_document_by_id("d1").unwrap().unwrap().status,
            DocumentStatus::Approved
        );
    }

    #[test]
    fn receipt_round_trip() {
        let mut db = Database::open_in_memory().unwrap();
        processed_document(&db, "d1", "h1");
        success_attempt(&db, "d1");

        let receipt = db.convert_to_receipt("d1").unwrap();
        assert_eq!(
            db.attempts_for_entity(EntityKind::Receipt, &receipt.id).unwrap().len(),
            1
        );

        let restored = db.revert_receipt(&receipt.id).unwrap();
        assert_eq!(restored.status, DocumentStatus::Processed);
        assert!(db.get_receipt_by_id(&receipt.id).unwrap().is_none());
        assert_eq!(db.attempts_for_entity(EntityKind::Document, "d1").unwrap().len(), 1);
    }
}
