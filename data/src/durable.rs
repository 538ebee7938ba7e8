//! On-disk candle records. One JSON file per (symbol, granularity) plus a
//! manifest with the write metadata, so delta ranges for the next session are
//! known without deserializing any candle arrays.
//!
//! Every operation degrades to a cache miss on I/O trouble. Records are fully
//! replaceable; losing the whole directory only costs a cold start.

use std::path::{Path, PathBuf};

use feed::{Candle, ChannelKey};
use serde::{Deserialize, Serialize};

const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableRecord {
    pub key: ChannelKey,
    pub written_ms: i64,
    pub last_candle_time: i64,
    pub candles: Vec<Candle>,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordMeta {
    pub written_ms: i64,
    pub last_candle_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestEntry {
    key: ChannelKey,
    file: String,
    written_ms: i64,
    last_candle_time: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    entries: Vec<ManifestEntry>,
}

pub struct DurableCandleCache {
    dir: PathBuf,
    max_records: usize,
}

impl DurableCandleCache {
    pub fn new(dir: PathBuf, max_records: usize) -> Self {
        Self { dir, max_records }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes or replaces the record for `key`, then trims the oldest written
    /// records above the bound. Never surfaces I/O failures.
    pub fn store(&self, key: ChannelKey, candles: &[Candle], written_ms: i64) {
        let Some(last_candle_time) = candles.last().map(|c| c.time) else {
            return;
        };

        let record = DurableRecord {
            key,
            written_ms,
            last_candle_time,
            candles: candles.to_vec(),
        };

        let file = record_file_name(&key);
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Could not serialize candle record for {key}: {e}");
                return;
            }
        };
        if let Err(e) = crate::write_json_to_file(&json, &self.dir.join(&file)) {
            log::warn!("Could not persist candle record for {key}: {e}");
            return;
        }

        let mut manifest = self.read_manifest();
        manifest.entries.retain(|entry| entry.key != key);
        manifest.entries.push(ManifestEntry {
            key,
            file,
            written_ms,
            last_candle_time,
        });

        while manifest.entries.len() > self.max_records {
            let oldest = manifest
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.written_ms)
                .map(|(i, _)| i);
            let Some(oldest) = oldest else { break };

            let evicted = manifest.entries.swap_remove(oldest);
            log::info!("Evicting durable record for {}", evicted.key);
            if let Err(e) = std::fs::remove_file(self.dir.join(&evicted.file)) {
                log::warn!("Could not remove evicted record '{}': {e}", evicted.file);
            }
        }

        self.write_manifest(&manifest);
    }

    pub fn load(&self, key: ChannelKey) -> Option<DurableRecord> {
        let path = self.dir.join(record_file_name(&key));
        match crate::read_from_file::<DurableRecord>(&path) {
            Ok(record) => Some(record),
            Err(crate::DataError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                log::warn!("Could not read candle record for {key}: {e}");
                None
            }
        }
    }

    /// Metadata without the candle payload, from the manifest alone.
    pub fn meta(&self, key: ChannelKey) -> Option<RecordMeta> {
        self.read_manifest()
            .entries
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| RecordMeta {
                written_ms: entry.written_ms,
                last_candle_time: entry.last_candle_time,
            })
    }

    pub fn remove(&self, key: ChannelKey) {
        let mut manifest = self.read_manifest();
        let before = manifest.entries.len();
        manifest.entries.retain(|entry| entry.key != key);
        if manifest.entries.len() != before {
            self.write_manifest(&manifest);
        }

        let path = self.dir.join(record_file_name(&key));
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            log::warn!("Could not remove candle record for {key}: {e}");
        }
    }

    pub fn record_count(&self) -> usize {
        self.read_manifest().entries.len()
    }

    fn read_manifest(&self) -> Manifest {
        let path = self.dir.join(MANIFEST_FILE);
        match crate::read_from_file::<Manifest>(&path) {
            Ok(manifest) => manifest,
            Err(crate::DataError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Manifest::default()
            }
            Err(e) => {
                log::warn!("Starting with an empty cache manifest: {e}");
                Manifest::default()
            }
        }
    }

    fn write_manifest(&self, manifest: &Manifest) {
        let json = match serde_json::to_string(manifest) {
            Ok(json) => json,
            Err(e) => {
                log::warn!("Could not serialize cache manifest: {e}");
                return;
            }
        };
        if let Err(e) = crate::write_json_to_file(&json, &self.dir.join(MANIFEST_FILE)) {
            log::warn!("Could not persist cache manifest: {e}");
        }
    }
}

fn record_file_name(key: &ChannelKey) -> String {
    format!("{}_{}.json", key.symbol.as_str(), key.granularity.as_secs())
}
