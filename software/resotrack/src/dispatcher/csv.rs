//! Plain CSV with one header row.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{OutputFormat, Record, SampleTable, Schema, fmt_cell, quote};

/// CSV over the union of every record's columns.
/// Cells a record does not have are left empty.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct CsvFile {}

/// Generate CSV header row given some column names
pub fn csv_header(columns: &[String]) -> String {
    let mut header_string = columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(",");
    header_string.push('\n');
    header_string
}

/// Format one CSV row into a reusable buffer
pub fn csv_row(stringbuf: &mut String, cells: &[Option<super::FieldValue>]) {
    stringbuf.clear();
    for (i, c) in cells.iter().enumerate() {
        if i > 0 {
            stringbuf.push(',');
        }
        stringbuf.push_str(&fmt_cell(c.as_ref()));
    }
    stringbuf.push('\n');
}

#[typetag::serde]
impl OutputFormat for CsvFile {
    fn extension(&self) -> &'static str {
        "csv"
    }

    fn write(&self, records: &[Record], path: &Path, _title: &str) -> Result<(), String> {
        let table = SampleTable::from_records(records, Schema::Union)?;

        let file = File::create(path).map_err(|e| e.to_string())?;
        let mut w = BufWriter::new(file);
        w.write_all(csv_header(table.available_columns()).as_bytes())
            .map_err(|e| e.to_string())?;

        let mut stringbuf = String::new();
        for row in table.rows() {
            csv_row(&mut stringbuf, row);
            w.write_all(stringbuf.as_bytes())
                .map_err(|e| e.to_string())?;
        }

        w.flush().map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn union_of_columns() {
        let dir = std::env::temp_dir().join(format!("resotrack-csv-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("union.csv");

        let recs: Vec<Record> = [json!({"a": 1.0}), json!({"b": "Stable", "a": 2.5})]
            .into_iter()
            .filter_map(|v| v.as_object().cloned())
            .collect();
        CsvFile::default().write(&recs, &path, "").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "a,b\n1,\n2.5,Stable\n");
    }
}
