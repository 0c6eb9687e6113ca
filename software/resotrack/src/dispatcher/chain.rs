//! Ordered fallback across output formats.
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{CsvFile, DatFile, JsonFile, OutputFormat, to_records};
use crate::error::{Error, Result};

/// Where a batch ended up
#[derive(Debug, Clone, PartialEq)]
pub struct SavedOutput {
    pub path: PathBuf,

    /// Extension of the format that succeeded
    pub format: &'static str,

    pub rows: usize,

    /// Errors from the formats tried before the one that succeeded
    pub fallbacks: Vec<String>,
}

/// Tries each format in order until one of them writes the file.
///
/// Every format writes next to the requested path with its own extension.
#[derive(Serialize, Deserialize)]
pub struct OutputChain {
    formats: Vec<Box<dyn OutputFormat>>,
}

impl Default for OutputChain {
    /// `.dat`, then `.csv`, then `.json`
    fn default() -> Self {
        let dat: Box<dyn OutputFormat> = Box::new(DatFile::default());
        let csv: Box<dyn OutputFormat> = Box::new(CsvFile::default());
        let json: Box<dyn OutputFormat> = Box::new(JsonFile::default());
        Self {
            formats: vec![dat, csv, json],
        }
    }
}

impl OutputChain {
    pub fn new(formats: Vec<Box<dyn OutputFormat>>) -> Self {
        Self { formats }
    }

    pub fn formats(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.formats.iter().map(|f| f.extension())
    }

    /// Write `samples` with the first format that succeeds.
    pub fn save<S: Serialize>(&self, samples: &[S], path: &Path, title: &str) -> Result<SavedOutput> {
        if samples.is_empty() {
            return Err(Error::NoData);
        }
        let records = to_records(samples)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| Error::persistence(dir, e))?;
        }

        let mut fallbacks = Vec::new();
        for format in &self.formats {
            let target = path.with_extension(format.extension());
            match format.write(&records, &target, title) {
                Ok(()) => {
                    info!("Saved {} rows to {target:?}", records.len());
                    return Ok(SavedOutput {
                        path: target,
                        format: format.extension(),
                        rows: records.len(),
                        fallbacks,
                    });
                }
                Err(e) => {
                    warn!("Writing {target:?} failed, trying next format: {e}");
                    // Partial output would shadow the fallback file
                    let _ = fs::remove_file(&target);
                    fallbacks.push(format!("{}: {e}", format.extension()));
                }
            }
        }

        Err(Error::persistence(path, fallbacks.join("; ")))
    }
}
