use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::services::state::AppState;

const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "tif", "tiff", "bmp"];

pub struct WatcherHandle {
    shutdown: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

/// Spawn the polling loop that scans the inbox on an interval. The first tick
/// fires immediately, so startup gets a scan without a separate call. The
/// interval follows `scan_interval_secs` and picks up settings changes on the
/// next tick.
pub fn start_watcher(state: Arc<AppState>) -> WatcherHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let task = tokio::spawn(async move {
        let mut period = scan_period(&state);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if flag.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = state.scan_inbox().await {
                tracing::error!("Inbox scan failed: {:#}", e);
            }
            let current = scan_period(&state);
            if current != period {
                tracing::info!(secs = current.as_secs(), "Scan interval changed");
                period = current;
                ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // A fresh interval ticks immediately; swallow that one so the
                // new cadence starts after a full period.
                ticker.tick().await;
            }
        }
    });

    WatcherHandle { shutdown, task }
}

fn scan_period(state: &AppState) -> Duration {
    let secs = state
        .current_settings()
        .map(|s| s.scan_interval_secs)
        .unwrap_or(30)
        .max(1);
    Duration::from_secs(secs)
}

pub fn is_supported_document(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn supported_extensions_are_case_insensitive() {
        assert!(is_supported_document(&PathBuf::from("/in/scan.PDF")));
        assert!(is_supported_document(&PathBuf::from("/in/receipt.jpeg")));
        assert!(is_supported_document(&PathBuf::from("/in/fax.TIFF")));
        assert!(!is_supported_document(&PathBuf::from("/in/notes.txt")));
        assert!(!is_supported_document(&PathBuf::from("/in/no_extension")));
    }

    #[test]
    fn hidden_files_are_detected() {
        assert!(is_hidden(&PathBuf::from("/in/.DS_Store")));
        assert!(is_hidden(&PathBuf::from("/in/.partial.pdf")));
        assert!(!is_hidden(&PathBuf::from("/in/invoice.pdf")));
    }
}
