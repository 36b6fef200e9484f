use anyhow::Result;
use chrono::{NaiveDate, Utc};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Date formats accepted from OCR providers, tried in order.
const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%Y/%m/%d"];

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Streaming SHA-256 over a file, hex encoded. Used as the dedup key and
/// stored as the document's content hash.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 over in-memory bytes. Pure function over content; identical
/// bytes always hash identically regardless of filename or location.
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn format_decimal(value: f64) -> String {
    format!("{:.2}", value)
}

/// Normalize a provider-reported date to `YYYY-MM-DD`, trying the accepted
/// formats in order. Returns `None` when no format matches.
pub fn normalize_date(value: Option<String>) -> Option<String> {
    let raw = value?.trim().to_string();
    if raw.is_empty() {
        return None;
    }

    for fmt in DATE_FORMATS.iter() {
        if let Ok(date) = NaiveDate::parse_from_str(&raw, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}
