use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a document in the inbox pipeline.
///
/// `created` → `processed` | `failed`; `failed` → `created` (retry);
/// `processed` → `approved` (conversion). Approved is terminal for the
/// document itself; further changes happen on the bill or receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Created,
    Processed,
    Failed,
    Approved,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Created => "created",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Approved => "approved",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(DocumentStatus::Created),
            "processed" => Ok(DocumentStatus::Processed),
            "failed" => Ok(DocumentStatus::Failed),
            "approved" => Ok(DocumentStatus::Approved),
            other => Err(format!("unknown document status '{}'", other)),
        }
    }
}

impl ToSql for DocumentStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for DocumentStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| s.parse().map_err(|e: String| FromSqlError::Other(e.into())))
    }
}

/// Discriminant of the polymorphic entity reference carried by OCR attempts.
///
/// A physical file changes identity as it moves from document to bill or
/// receipt; attempt history follows it by re-pointing this reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Document,
    Bill,
    Receipt,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Document => "document",
            EntityKind::Bill => "bill",
            EntityKind::Receipt => "receipt",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document" => Ok(EntityKind::Document),
            "bill" => Ok(EntityKind::Bill),
            "receipt" => Ok(EntityKind::Receipt),
            other => Err(format!("unknown entity kind '{}'", other)),
        }
    }
}

impl ToSql for EntityKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EntityKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| s.parse().map_err(|e: String| FromSqlError::Other(e.into())))
    }
}

/// Outcome of one recorded OCR invocation. `in_progress` is part of the
/// stored vocabulary but the orchestrator only writes terminal statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
    InProgress,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Success => "success",
            AttemptStatus::Failed => "failed",
            AttemptStatus::InProgress => "in_progress",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptStatus::Success),
            "failed" => Ok(AttemptStatus::Failed),
            "in_progress" => Ok(AttemptStatus::InProgress),
            other => Err(format!("unknown attempt status '{}'", other)),
        }
    }
}

impl ToSql for AttemptStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AttemptStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .and_then(|s| s.parse().map_err(|e: String| FromSqlError::Other(e.into())))
    }
}

/// One physical file as tracked through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub original_filename: String,
    pub stored_path: String,
    pub content_hash: String,
    pub upload_timestamp: String,
    pub status: DocumentStatus,
    pub provider: Option<String>,
    pub amount: Option<String>,
    pub document_date: Option<String>,
    pub currency: Option<String>,
    pub failure_reason: Option<String>,
    pub linked_entity_kind: Option<EntityKind>,
    pub linked_entity_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Terminal representation created from an approved document, or entered
/// manually (in which case `original_document_id` is `None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bill {
    pub id: String,
    pub original_filename: String,
    pub stored_path: Option<String>,
    pub content_hash: Option<String>,
    pub upload_timestamp: Option<String>,
    pub provider: Option<String>,
    pub amount: Option<String>,
    pub document_date: Option<String>,
    pub currency: Option<String>,
    pub original_document_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: String,
    pub original_filename: String,
    pub stored_path: Option<String>,
    pub content_hash: Option<String>,
    pub upload_timestamp: Option<String>,
    pub provider: Option<String>,
    pub amount: Option<String>,
    pub document_date: Option<String>,
    pub currency: Option<String>,
    pub original_document_id: Option<String>,
    pub bill_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Immutable audit record of one OCR provider invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrAttempt {
    pub id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub timestamp: String,
    pub engine_used: String,
    pub status: AttemptStatus,
    pub extracted_json: Option<String>,
    pub error_message: Option<String>,
    pub raw_response: Option<String>,
}

/// Structured fields pulled out of a scanned bill by a vision provider.
/// `date` is normalized to `YYYY-MM-DD` before it lands here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub provider: Option<String>,
    pub amount: Option<f64>,
    pub date: Option<String>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDetail {
    pub document: Document,
    pub latest_attempt: Option<OcrAttempt>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub inbox_folder: Option<String>,
    pub storage_folder: Option<String>,
    pub scan_interval_secs: u64,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            inbox_folder: None,
            storage_folder: None,
            scan_interval_secs: 30,
            openai_api_key: None,
            gemini_api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_status_round_trips_through_str() {
        for status in [
            DocumentStatus::Created,
            DocumentStatus::Processed,
            DocumentStatus::Failed,
            DocumentStatus::Approved,
        ] {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("pending".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn entity_kind_round_trips_through_str() {
        for kind in [EntityKind::Document, EntityKind::Bill, EntityKind::Receipt] {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
    }

    #[test]
    fn attempt_status_round_trips_through_str() {
        for status in [
            AttemptStatus::Success,
            AttemptStatus::Failed,
            AttemptStatus::InProgress,
        ] {
            assert_eq!(status.as_str().parse::<AttemptStatus>().unwrap(), status);
        }
    }
}
