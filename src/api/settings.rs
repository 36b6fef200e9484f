use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::db::Database;
use crate::models::Settings;
use crate::services::crypto::CryptoService;
use crate::services::state::{AppState, ScanOutcome};

const KEY_INBOX_FOLDER: &str = "inbox_folder";
const KEY_STORAGE_FOLDER: &str = "storage_folder";
const KEY_SCAN_INTERVAL: &str = "scan_interval_secs";
const KEY_OPENAI_API_KEY: &str = "openai_api_key";
const KEY_GEMINI_API_KEY: &str = "gemini_api_key";

#[derive(Debug, Deserialize)]
pub struct SettingsPayload {
    pub inbox_folder: Option<String>,
    pub storage_folder: Option<String>,
    pub scan_interval_secs: Option<u64>,
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
}

/// Read the settings table into a `Settings` snapshot. Credentials stay in
/// their stored (encrypted) form; decryption happens where they are used.
pub fn load_settings(db: &Database) -> Result<Settings> {
    let scan_interval_secs = db
        .get_setting(KEY_SCAN_INTERVAL)?
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| Settings::default().scan_interval_secs);
    Ok(Settings {
        inbox_folder: db.get_setting(KEY_INBOX_FOLDER)?,
        storage_folder: db.get_setting(KEY_STORAGE_FOLDER)?,
        scan_interval_secs,
        openai_api_key: db.get_setting(KEY_OPENAI_API_KEY)?,
        gemini_api_key: db.get_setting(KEY_GEMINI_API_KEY)?,
    })
}

pub fn get_settings(state: &AppState) -> Result<Settings> {
    state.current_settings()
}

/// Persist the provided fields and swap the live snapshot. API keys are
/// encrypted before they touch the database; omitted fields are untouched.
pub fn save_settings(state: &AppState, payload: SettingsPayload) -> Result<Settings> {
    let updated = {
        let db = state.db.lock().map_err(|_| anyhow!("DB lock poisoned"))?;
        if let Some(folder) = &payload.inbox_folder {
            db.set_setting(KEY_INBOX_FOLDER, folder)?;
        }
        if let Some(folder) = &payload.storage_folder {
            db.set_setting(KEY_STORAGE_FOLDER, folder)?;
        }
        if let Some(secs) = payload.scan_interval_secs {
            db.set_setting(KEY_SCAN_INTERVAL, &secs.to_string())?;
        }
        if let Some(key) = &payload.openai_api_key {
            let stored = CryptoService::encrypt_credential(KEY_OPENAI_API_KEY, key)?;
            db.set_setting(KEY_OPENAI_API_KEY, &stored)?;
        }
        if let Some(key) = &payload.gemini_api_key {
            let stored = CryptoService::encrypt_credential(KEY_GEMINI_API_KEY, key)?;
            db.set_setting(KEY_GEMINI_API_KEY, &stored)?;
        }
        load_settings(&db)?
    };
    state.replace_settings(updated.clone())?;
    tracing::info!("Settings updated");
    Ok(updated)
}

/// Cheap liveness check for an OpenAI key: list models and look at the
/// status code.
pub async fn verify_openai_key(api_key: &str) -> Result<bool> {
    let client = reqwest::Client::new();
    let response = client
        .get("https://api.openai.com/v1/models")
        .bearer_auth(api_key)
        .send()
        .await?;
    Ok(response.status().is_success())
}

/// User-triggered scan, same pass the watcher runs on its interval.
pub async fn rescan(state: &AppState) -> Result<ScanOutcome> {
    state.scan_inbox().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_round_trip_through_the_table() {
        let db = Database::open_in_memory().unwrap();
        db.set_setting(KEY_INBOX_FOLDER, "/inbox").unwrap();
        db.set_setting(KEY_STORAGE_FOLDER, "/storage").unwrap();
        db.set_setting(KEY_SCAN_INTERVAL, "10").unwrap();

        let settings = load_settings(&db).unwrap();
        assert_eq!(settings.inbox_folder.as_deref(), Some("/inbox"));
        assert_eq!(settings.storage_folder.as_deref(), Some("/storage"));
        assert_eq!(settings.scan_interval_secs, 10);
        assert!(settings.openai_api_key.is_none());
    }

    #[test]
    fn missing_interval_falls_back_to_default() {
        let db = Database::open_in_memory().unwrap();
        let settings = load_settings(&db).unwrap();
        assert_eq!(settings.scan_interval_secs, Settings::default().scan_interval_secs);
    }

    #[test]
    fn unparseable_interval_falls_back_to_default() {
        let db = Database::open_in_memory().unwrap();
        db.set_setting(KEY_SCAN_INTERVAL, "soon").unwrap();
        let settings = load_settings(&db).unwrap();
        assert_eq!(settings.scan_interval_secs, Settings::default().scan_interval_secs);
    }
}
