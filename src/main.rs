use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use ledgerbox::api::settings::load_settings;
use ledgerbox::db::Database;
use ledgerbox::services::state::AppState;
use ledgerbox::services::watcher;

fn data_dir() -> PathBuf {
    std::env::var("LEDGERBOX_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("ledgerbox-data"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let dir = data_dir();
    std::fs::create_dir_all(&dir)?;
    let db = Database::new(dir.join("ledgerbox.sqlite"))?;
    let settings = load_settings(&db)?;
    let state = Arc::new(AppState::new(db, settings));

    let handle = watcher::start_watcher(state.clone());
    tracing::info!(data_dir = %dir.display(), "ledgerbox running, watching inbox");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.shutdown();
    Ok(())
}
