//! Periodic spill of buffered samples to numbered JSON files,
//! so that a crash loses at most one save interval of data.
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Directory of `temp_000.json`, `temp_001.json`, ... chunks for one recording
#[derive(Debug, Clone)]
pub struct ChunkStore {
    dir: PathBuf,
    files: Vec<PathBuf>,
}

impl ChunkStore {
    /// Create (or reuse) the chunk directory
    pub fn create(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).map_err(|e| Error::persistence(&dir, e))?;
        Ok(Self {
            dir,
            files: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Chunks written so far, in order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Write one chunk. Nothing is written for an empty batch.
    pub fn flush<T: Serialize>(&mut self, samples: &[T]) -> Result<Option<PathBuf>> {
        if samples.is_empty() {
            return Ok(None);
        }
        let path = self.dir.join(format!("temp_{:03}.json", self.files.len()));
        let text = serde_json::to_string(samples)?;
        fs::write(&path, text).map_err(|e| Error::persistence(&path, e))?;
        info!("Saved {} samples to {path:?}", samples.len());
        self.files.push(path.clone());
        Ok(Some(path))
    }

    /// Read every chunk back in order. Unreadable chunks are skipped with a warning.
    pub fn load_all<T: DeserializeOwned>(&self) -> Vec<T> {
        let mut out = Vec::new();
        for path in &self.files {
            let parsed = fs::read_to_string(path)
                .map_err(|e| e.to_string())
                .and_then(|text| serde_json::from_str::<Vec<T>>(&text).map_err(|e| e.to_string()));
            match parsed {
                Ok(mut chunk) => out.append(&mut chunk),
                Err(e) => warn!("Skipping unreadable chunk {path:?}: {e}"),
            }
        }
        out
    }

    /// Delete the chunk files and their directory
    pub fn cleanup(&mut self) {
        for path in self.files.drain(..) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Could not remove {path:?}: {e}");
            }
        }
        if let Err(e) = fs::remove_dir(&self.dir) {
            warn!("Could not remove {:?}: {e}", self.dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_roundtrip_in_order() {
        let dir = std::env::temp_dir()
            .join(format!("resotrack-chunk-{}", std::process::id()))
            .join("recording");
        let mut store = ChunkStore::create(dir.clone()).unwrap();

        assert_eq!(store.flush::<f64>(&[]).unwrap(), None);
        store.flush(&[1.0, 2.0]).unwrap();
        store.flush(&[3.0]).unwrap();
        assert!(store.files()[1].ends_with("temp_001.json"));

        // A damaged chunk is skipped, the rest survive
        fs::write(&store.files()[0], "[1.0,").unwrap();
        assert_eq!(store.load_all::<f64>(), vec![3.0]);

        store.cleanup();
        assert!(!dir.exists());
    }

    #[test]
    fn nan_readings_survive_a_chunk() {
        use std::collections::BTreeMap;

        use crate::controller::{Fields, RecordSample};
        use crate::dispatcher::FieldValue;
        use resotrack_shared::InstrumentKind;

        let dir = std::env::temp_dir()
            .join(format!("resotrack-chunk-{}", std::process::id()))
            .join("nan");
        let _ = fs::remove_dir_all(&dir);
        let mut store = ChunkStore::create(dir).unwrap();

        let samples: Vec<RecordSample> = (0..100)
            .map(|i| {
                let x = if i == 50 { f64::NAN } else { i as f64 };
                let fields: Fields = BTreeMap::from([("X".to_owned(), FieldValue::Number(x))]);
                RecordSample {
                    elapsed_time: i as f64,
                    wall_timestamp: i as f64,
                    readings: BTreeMap::from([(
                        InstrumentKind::Sr830,
                        BTreeMap::from([("GPIB0::8".to_owned(), fields)]),
                    )]),
                }
            })
            .collect();
        store.flush(&samples).unwrap();

        let loaded: Vec<RecordSample> = store.load_all();
        assert_eq!(loaded.len(), 100);
        let x = |s: &RecordSample| s.get(InstrumentKind::Sr830, "GPIB0::8", "X").cloned();
        assert!(matches!(x(&loaded[50]), Some(FieldValue::Number(v)) if v.is_nan()));
        assert_eq!(x(&loaded[51]), Some(FieldValue::Number(51.0)));
        store.cleanup();
    }
}
