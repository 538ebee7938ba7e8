pub mod cache;
pub mod durable;
pub mod prefetch;
pub mod series;
pub mod tracker;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub use cache::{CacheConfig, CacheStats, TieredCache};
pub use prefetch::{PrefetchScheduler, PrefetchTask, UsageStats};
pub use series::{CandlePatch, ColumnarCandleStore, MergeOutcome};
pub use tracker::{ChangeSet, ChangeTracker, Channel};

use ::log::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum DataError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub fn write_json_to_file(json: &str, path: &Path) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid data file path")
    })?;

    if !parent.exists() {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    Ok(())
}

/// Reads and parses one JSON file. A file that no longer parses is renamed
/// with an `_old` suffix so the next write starts clean while the broken copy
/// stays around for inspection.
pub fn read_from_file<T>(path: &Path) -> Result<T, DataError>
where
    T: serde::de::DeserializeOwned,
{
    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    match serde_json::from_str(&contents) {
        Ok(value) => Ok(value),
        Err(e) => {
            drop(file);

            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("data");
            let backup_path = match path.extension().and_then(|e| e.to_str()) {
                Some(ext) => path.with_file_name(format!("{stem}_old.{ext}")),
                None => path.with_file_name(format!("{stem}_old")),
            };

            if let Err(rename_err) = std::fs::rename(path, &backup_path) {
                warn!(
                    "Failed to back up corrupted file '{}' to '{}': {}",
                    path.display(),
                    backup_path.display(),
                    rename_err
                );
            } else {
                info!(
                    "Backed up corrupted file to '{}'. It can be restored manually.",
                    backup_path.display()
                );
            }

            Err(DataError::Parse(e))
        }
    }
}

/// Default on-disk location for cache records and usage stats. The
/// `CANDLESTREAM_DATA_PATH` variable overrides the platform data directory.
pub fn data_path(path_name: Option<&str>) -> PathBuf {
    let base = if let Ok(path) = std::env::var("CANDLESTREAM_DATA_PATH") {
        PathBuf::from(path)
    } else {
        dirs_next::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("candlestream")
    };

    match path_name {
        Some(path_name) => base.join(path_name),
        None => base,
    }
}
