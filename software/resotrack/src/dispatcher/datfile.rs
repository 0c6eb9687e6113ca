//! Quantum Design style `.dat` data file, as read by MultiVu and its analysis tools.
//!
//! ```text
//! [Header]
//! TITLE,Frequency Tracking Data
//! BYAPP,resotrack,0.1.0
//! FILEOPENTIME,1718000000.000000,06/10/2024,07:13:20 AM
//! [Data]
//! Comment,Time Stamp (sec),time,frequency,...
//! ,1718000000.25,0.1,32768.2,...
//! ```
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::{OutputFormat, Record, SampleTable, Schema, fmt_cell, quote, unix_seconds};

/// Column carrying the wall-clock time of each record; it becomes the leading
/// `Time Stamp (sec)` column instead of a regular one.
const TIMESTAMP_COLUMN: &str = "timestamp";

/// Fixed-schema `.dat` writer.
///
/// The column set is taken from the first record. A later record that
/// introduces a new column fails the write, which hands the batch to the
/// next format in the chain.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct DatFile {}

#[typetag::serde]
impl OutputFormat for DatFile {
    fn extension(&self) -> &'static str {
        "dat"
    }

    fn write(&self, records: &[Record], path: &Path, title: &str) -> Result<(), String> {
        let table = SampleTable::from_records(records, Schema::FirstRecord)?;
        let ts_index = table.column_index(TIMESTAMP_COLUMN);

        let file = File::create(path).map_err(|e| e.to_string())?;
        let mut w = BufWriter::new(file);
        write_header(&mut w, title).map_err(|e| e.to_string())?;

        let mut line = String::from("Comment,Time Stamp (sec)");
        for (j, name) in table.available_columns().iter().enumerate() {
            if Some(j) != ts_index {
                line.push(',');
                line.push_str(&quote(name));
            }
        }
        writeln!(w, "{line}").map_err(|e| e.to_string())?;

        for row in table.rows() {
            line.clear();
            line.push(',');
            if let Some(i) = ts_index {
                line.push_str(&fmt_cell(row[i].as_ref()));
            }
            for (j, cell) in row.iter().enumerate() {
                if Some(j) != ts_index {
                    line.push(',');
                    line.push_str(&fmt_cell(cell.as_ref()));
                }
            }
            writeln!(w, "{line}").map_err(|e| e.to_string())?;
        }

        w.flush().map_err(|e| e.to_string())
    }
}

fn write_header(w: &mut impl Write, title: &str) -> std::io::Result<()> {
    let now = SystemTime::now();
    let local = DateTime::<Local>::from(now);
    writeln!(w, "[Header]")?;
    writeln!(w, "TITLE,{}", quote(title))?;
    writeln!(w, "BYAPP,resotrack,{}", env!("CARGO_PKG_VERSION"))?;
    writeln!(
        w,
        "FILEOPENTIME,{:.6},{},{}",
        unix_seconds(now),
        local.format("%m/%d/%Y"),
        local.format("%I:%M:%S %p")
    )?;
    writeln!(w, "[Data]")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn scratch(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("resotrack-dat-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn records(values: Vec<serde_json::Value>) -> Vec<Record> {
        values
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect()
    }

    #[test]
    fn timestamp_leads_each_row() {
        let path = scratch("lead.dat");
        let recs = records(vec![
            json!({"time": 0.0, "timestamp": 100.5, "frequency": 10.0}),
            json!({"time": 0.1, "timestamp": 100.6, "frequency": 10.5}),
        ]);
        DatFile::default().write(&recs, &path, "Test").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "[Header]");
        assert_eq!(lines[1], "TITLE,Test");
        let data = lines.iter().position(|l| *l == "[Data]").unwrap();
        assert_eq!(lines[data + 1], "Comment,Time Stamp (sec),time,frequency");
        assert_eq!(lines[data + 2], ",100.5,0,10");
        assert_eq!(lines[data + 3], ",100.6,0.1,10.5");
        assert_eq!(lines.len(), data + 4);
    }

    #[test]
    fn new_column_is_rejected() {
        let path = scratch("reject.dat");
        let recs = records(vec![
            json!({"timestamp": 1.0, "a": 1.0}),
            json!({"timestamp": 2.0, "a": 1.0, "b": 2.0}),
        ]);
        assert!(DatFile::default().write(&recs, &path, "Test").is_err());
    }

    #[test]
    fn missing_cells_are_blank() {
        let path = scratch("blank.dat");
        let recs = records(vec![
            json!({"timestamp": 1.0, "a": 1.0, "b": 2.0}),
            json!({"timestamp": 2.0, "b": 3.0}),
        ]);
        DatFile::default().write(&recs, &path, "Test").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().last(), Some(",2,,3"));
    }
}
