use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Upper bound on collision-suffix probing. A thousand same-day files with
/// the same name means something else is wrong; fail instead of spinning.
const MAX_COLLISION_SUFFIX: u32 = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no free storage name for '{filename}' after {MAX_COLLISION_SUFFIX} collision suffixes")]
    TooManyCollisions { filename: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Derive the destination for an inbox file: `{yyyy-MM-dd}-{filename}` under
/// the storage root, with a numeric suffix before the extension when the
/// name is taken. The free-name check is filesystem-existence based, so
/// concurrent placements of different files never share a counter.
pub fn build_storage_path(
    storage_root: &Path,
    upload_date: &str,
    original_filename: &str,
) -> Result<PathBuf, StorageError> {
    let base_name = format!("{}-{}", upload_date, original_filename);
    let candidate = storage_root.join(&base_name);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let (stem, extension) = split_filename(&base_name);
    for suffix in 1..=MAX_COLLISION_SUFFIX {
        let name = match extension {
            Some(ext) => format!("{}-{}.{}", stem, suffix, ext),
            None => format!("{}-{}", stem, suffix),
        };
        let candidate = storage_root.join(name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(StorageError::TooManyCollisions {
        filename: original_filename.to_string(),
    })
}

/// Move an inbox file to its storage destination, creating the storage root
/// as needed. Rename first; fall back to copy-and-remove for cross-device
/// moves (inbox and storage may sit on different mounts).
pub fn move_into_storage(source: &Path, destination: &Path) -> Result<(), StorageError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(source, destination)?;
            fs::remove_file(source)?;
            Ok(())
        }
    }
}

fn split_filename(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}
