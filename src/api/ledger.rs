use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::models::{Bill, Document, EntityKind, Receipt};
use crate::services::state::AppState;
use crate::utils::{format_decimal, normalize_date, now_rfc3339};

/// Fields for a bill or receipt entered by hand, without a scanned document
/// behind it. Manual entries cannot be reverted.
#[derive(Debug, Deserialize)]
pub struct ManualEntryPayload {
    pub original_filename: String,
    pub provider: Option<String>,
    pub amount: Option<f64>,
    pub document_date: Option<String>,
    pub currency: Option<String>,
    /// Receipt only: the bill this receipt settles.
    pub bill_id: Option<String>,
}

pub fn convert_document_to_bill(state: &AppState, document_id: &str) -> Result<Bill> {
    let mut db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    let bill = db.convert_to_bill(document_id)?;
    tracing::info!(document_id, bill_id = %bill.id, "Document converted to bill");
    Ok(bill)
}

pub fn convert_document_to_receipt(state: &AppState, document_id: &str) -> Result<Receipt> {
    let mut db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    let receipt = db.convert_to_receipt(document_id)?;
    tracing::info!(document_id, receipt_id = %receipt.id, "Document converted to receipt");
    Ok(receipt)
}

/// Undo a conversion: delete the bill and put its source document back into
/// `processed`, attempt history included.
pub fn revert_bill(state: &AppState, bill_id: &str) -> Result<Document> {
    let mut db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    let document = db.revert_bill(bill_id)?;
    tracing::info!(bill_id, document_id = %document.id, "Bill reverted to document");
    Ok(document)
}

pub fn revert_receipt(state: &AppState, receipt_id: &str) -> Result<Document> {
    let mut db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    let document = db.revert_receipt(receipt_id)?;
    tracing::info!(receipt_id, document_id = %document.id, "Receipt reverted to document");
    Ok(document)
}

pub fn create_bill(state: &AppState, payload: ManualEntryPayload) -> Result<Bill> {
    let now = now_rfc3339();
    let bill = Bill {
        id: uuid::Uuid::new_v4().to_string(),
        original_filename: payload.original_filename,
        stored_path: None,
        content_hash: None,
        upload_timestamp: None,
        provider: payload.provider,
        amount: payload.amount.map(format_decimal),
        document_date: normalize_date(payload.document_date),
        currency: payload.currency,
        original_document_id: None,
        created_at: now.clone(),
        updated_at: now,
    };
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    db.insert_bill(&bill)?;
    Ok(bill)
}

pub fn create_receipt(state: &AppState, payload: ManualEntryPayload) -> Result<Receipt> {
    let now = now_rfc3339();
    let receipt = Receipt {
        id: uuid::Uuid::new_v4().to_string(),
        original_filename: payload.original_filename,
        stored_path: None,
        content_hash: None,
        upload_timestamp: None,
        provider: payload.provider,
        amount: payload.amount.map(format_decimal),
        document_date: normalize_date(payload.document_date),
        currency: payload.currency,
        original_document_id: None,
        bill_id: payload.bill_id,
        created_at: now.clone(),
        updated_at: now,
    };
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    db.insert_receipt(&receipt)?;
    Ok(receipt)
}

pub fn list_bills(state: &AppState) -> Result<Vec<Bill>> {
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    Ok(db.list_bills()?)
}

pub fn list_receipts(state: &AppState) -> Result<Vec<Receipt>> {
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    Ok(db.list_receipts()?)
}

/// Delete a bill outright, attempt history included. Unlike revert, the
/// source document (if any) stays approved.
pub fn delete_bill(state: &AppState, bill_id: &str) -> Result<()> {
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    db.purge_attempts_for_entity(EntityKind::Bill, bill_id)?;
    if db.delete_bill(bill_id)? == 0 {
        return Err(anyhow!("Bill not found: {}", bill_id));
    }
    Ok(())
}

pub fn delete_receipt(state: &AppState, receipt_id: &str) -> Result<()> {
    let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
    db.purge_attempts_for_entity(EntityKind::Receipt, receipt_id)?;
    if db.delete_receipt(receipt_id)? == 0 {
        return Err(anyhow!("Receipt not found: {}", receipt_id));
    }
    Ok(())
}
