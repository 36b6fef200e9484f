use rusqlite::{params, OptionalExtension, Result as SqlResult, Row};

use super::Database;
use crate::models::{Document, DocumentStatus};

const DOCUMENT_COLUMNS: &str = "id, original_filename, stored_path, content_hash, upload_timestamp, \
     status, provider, amount, document_date, currency, failure_reason, \
     linked_entity_kind, linked_entity_id, created_at, updated_at";

/// Connection-level fetch so conversion transactions can read documents
/// through the same statement text as the plain accessors.
pub(crate) fn fetch_document(
    conn: &rusqlite::Connection,
    id: &str,
) -> SqlResult<Option<Document>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM documents WHERE id = ?1",
        DOCUMENT_COLUMNS
    ))?;
    stmt.query_row(params![id], map_document).optional()
}

/// Connection-level update so it can also run inside a transaction.
pub(crate) fn update_document_row(
    conn: &rusqlite::Connection,
    document: &Document,
) -> SqlResult<()> {
    conn.execute(
        "UPDATE documents SET
            original_filename = ?2, stored_path = ?3, content_hash = ?4,
            upload_timestamp = ?5, status = ?6, provider = ?7, amount = ?8,
            document_date = ?9, currency = ?10, failure_reason = ?11,
            linked_entity_kind = ?12, linked_entity_id = ?13, updated_at = ?14
         WHERE id = ?1",
        params![
            document.id,
            document.original_filename,
            document.stored_path,
            document.content_hash,
            document.upload_timestamp,
            document.status,
            document.provider,
            document.amount,
            document.document_date,
            document.currency,
            document.failure_reason,
            document.linked_entity_kind,
            document.linked_entity_id,
            document.updated_at
        ],
    )?;
    Ok(())
}

fn map_document(row: &Row<'_>) -> SqlResult<Document> {
    Ok(Document {
        id: row.get(0)?,
        original_filename: row.get(1)?,
        stored_path: row.get(2)?,
        content_hash: row.get(3)?,
        upload_timestamp: row.get(4)?,
        status: row.get(5)?,
        provider: row.get(6)?,
        amount: row.get(7)?,
        document_date: row.get(8)?,
        currency: row.get(9)?,
        failure_reason: row.get(10)?,
        linked_entity_kind: row.get(11)?,
        linked_entity_id: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl Database {
    /// Insert a freshly discovered document. The UNIQUE constraint on
    /// `content_hash` is the last line of defense against two copies of the
    /// same file racing past the dedup lookup.
    pub fn insert_document(&self, document: &Document) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO documents (
                id, original_filename, stored_path, content_hash, upload_timestamp,
                status, provider, amount, document_date, currency, failure_reason,
                linked_entity_kind, linked_entity_id, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                document.id,
                document.original_filename,
                document.stored_path,
                document.content_hash,
                document.upload_timestamp,
                document.status,
                document.provider,
                document.amount,
                document.document_date,
                document.currency,
                document.failure_reason,
                document.linked_entity_kind,
                document.linked_entity_id,
                document.created_at,
                document.updated_at
            ],
        )?;
        Ok(())
    }

    pub fn update_document(&self, document: &Document) -> SqlResult<()> {
        update_document_row(&self.conn, document)
    }

    pub fn get_document_by_id(&self, id: &str) -> SqlResult<Option<Document>> {
        fetch_document(&self.conn, id)
    }

    pub fn find_document_by_hash(&self, content_hash: &str) -> SqlResult<Option<Document>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM documents WHERE content_hash = ?1",
            DOCUMENT_COLUMNS
        ))?;
        stmt.query_row(params![content_hash], map_document).optional()
    }

    pub fn list_documents_by_status(&self, status: DocumentStatus) -> SqlResult<Vec<Document>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM documents WHERE status = ?1 ORDER BY upload_timestamp DESC",
            DOCUMENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![status], map_document)?;
        rows.collect()
    }

    /// Documents still in play, i.e. not yet converted to a bill or receipt.
    pub fn list_active_documents(&self) -> SqlResult<Vec<Document>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM documents WHERE status != 'approved' ORDER BY upload_timestamp DESC",
            DOCUMENT_COLUMNS
        ))?;
        let rows = stmt.query_map([], map_document)?;
        rows.collect()
    }

    pub fn delete_document(&self, id: &str) -> SqlResult<usize> {
        self.conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
    }
}
