//! Last-resort JSON dump of the records as they were collected.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{OutputFormat, Record};

/// Pretty-printed JSON array of the unflattened records
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct JsonFile {}

#[typetag::serde]
impl OutputFormat for JsonFile {
    fn extension(&self) -> &'static str {
        "json"
    }

    fn write(&self, records: &[Record], path: &Path, _title: &str) -> Result<(), String> {
        let file = File::create(path).map_err(|e| e.to_string())?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut w, records).map_err(|e| e.to_string())?;
        w.flush().map_err(|e| e.to_string())
    }
}
