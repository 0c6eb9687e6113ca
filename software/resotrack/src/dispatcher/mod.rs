//! Dispatchers turn collected samples into files on disk.
//!
//! Samples of any shape are first reduced to flat records, then written by
//! one of several [`OutputFormat`]s tried in order by an [`OutputChain`].
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

mod chain;
pub use chain::{OutputChain, SavedOutput};
mod chunk;
pub use chunk::ChunkStore;
mod csv;
pub use csv::CsvFile;
mod datfile;
pub use datfile::DatFile;
mod json;
pub use json::JsonFile;
#[cfg(feature = "df")]
mod df;

/// One sample as a JSON object, nested or flat
pub type Record = Map<String, Value>;

/// A single cell of recorded data.
///
/// Non-finite numbers are written as JSON `null` and read back as NaN.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Number(#[serde(deserialize_with = "nan_if_null")] f64),
    Text(String),
}

fn nan_if_null<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NAN))
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(x) => Some(*x),
            Self::Text(_) => None,
        }
    }

    fn from_json(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Bool(b) => Some(Self::Number(if *b { 1.0 } else { 0.0 })),
            Value::Null => None,
            // Flattened away before this point
            Value::Array(_) | Value::Object(_) => Some(Self::Text(v.to_string())),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        Self::Number(x)
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

/// A data file format that can take a batch of records.
#[typetag::serde(tag = "type")]
pub trait OutputFormat: Send + Sync {
    /// Short name, also used as the file extension
    fn extension(&self) -> &'static str;

    /// Write all records to `path`, replacing any existing file
    fn write(&self, records: &[Record], path: &Path, title: &str) -> std::result::Result<(), String>;
}

/// Serialize samples to JSON objects
pub fn to_records<S: Serialize>(samples: &[S]) -> Result<Vec<Record>> {
    samples
        .iter()
        .map(|s| match serde_json::to_value(s)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::config(format!(
                "samples must serialize to objects, got `{other}`"
            ))),
        })
        .collect()
}

/// Flatten nested objects into a single level, joining keys with `_`
pub fn flatten(record: &Record) -> Vec<(String, Value)> {
    let mut out = Vec::with_capacity(record.len());
    flatten_into(&mut out, None, record);
    out
}

fn flatten_into(out: &mut Vec<(String, Value)>, prefix: Option<&str>, record: &Record) {
    for (k, v) in record {
        let key = match prefix {
            Some(p) => format!("{p}_{k}"),
            None => k.clone(),
        };
        match v {
            Value::Object(inner) => flatten_into(out, Some(&key), inner),
            _ => out.push((key, v.clone())),
        }
    }
}

/// How the column set of a table is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// Columns of the first record; later records may not add any
    FirstRecord,

    /// Every column seen in any record, in order of first appearance
    Union,
}

/// Flattened records as a rectangular table with possibly-missing cells.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleTable {
    columns: Vec<String>,
    rows: Vec<Vec<Option<FieldValue>>>,
}

impl SampleTable {
    pub fn from_records(records: &[Record], schema: Schema) -> std::result::Result<Self, String> {
        let flat: Vec<Vec<(String, Value)>> = records.iter().map(flatten).collect();

        let mut columns: Vec<String> = Vec::new();
        for (i, row) in flat.iter().enumerate() {
            for (name, _) in row {
                if columns.contains(name) {
                    continue;
                }
                if schema == Schema::FirstRecord && i > 0 {
                    return Err(format!(
                        "record {i} has column `{name}` that is not in the first record"
                    ));
                }
                columns.push(name.clone());
            }
        }

        let rows = flat
            .iter()
            .map(|row| {
                let mut cells = vec![None; columns.len()];
                for (name, value) in row {
                    if let Some(j) = columns.iter().position(|c| c == name) {
                        cells[j] = FieldValue::from_json(value);
                    }
                }
                cells
            })
            .collect();

        Ok(Self { columns, rows })
    }

    /// Union-schema table of any serializable samples
    pub fn from_samples<S: Serialize>(samples: &[S]) -> Result<Self> {
        let records = to_records(samples)?;
        Self::from_records(&records, Schema::Union).map_err(Error::config)
    }

    /// Column names available for plotting or export
    pub fn available_columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn rows(&self) -> &[Vec<Option<FieldValue>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Paired numeric values of two columns, skipping rows where either is missing.
    /// Empty if either column does not exist.
    pub fn series(&self, x: &str, y: &str) -> (Vec<f64>, Vec<f64>) {
        let (Some(i), Some(j)) = (self.column_index(x), self.column_index(y)) else {
            return (Vec::new(), Vec::new());
        };
        self.rows
            .iter()
            .filter_map(|row| {
                let xv = row[i].as_ref()?.as_f64()?;
                let yv = row[j].as_ref()?.as_f64()?;
                Some((xv, yv))
            })
            .unzip()
    }
}

/// Fixed-width ISO-8601 UTC timestamp with zero-padded sub-second nanoseconds and Z-suffix
pub fn fmt_time(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}

/// Seconds since the unix epoch
pub fn unix_seconds(time: SystemTime) -> f64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Format one cell for a comma-separated line
pub fn fmt_cell(cell: Option<&FieldValue>) -> String {
    match cell {
        None => String::new(),
        Some(FieldValue::Number(x)) => format!("{x}"),
        Some(FieldValue::Text(s)) => quote(s),
    }
}

/// Quote text that would otherwise break a comma-separated line
pub fn quote(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn nested_keys_are_joined() {
        let r = record(json!({
            "time": 1.0,
            "SR830": {"GPIB0::8::INSTR": {"X": 0.5, "theta": -3.0}},
            "PPMS": {"127.0.0.1": {"temp_status": "Stable"}}
        }));
        let keys: Vec<String> = flatten(&r).into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            [
                "time",
                "SR830_GPIB0::8::INSTR_X",
                "SR830_GPIB0::8::INSTR_theta",
                "PPMS_127.0.0.1_temp_status"
            ]
        );
    }

    #[test]
    fn union_schema_leaves_gaps() {
        let records = [
            record(json!({"time": 0.0, "a": 1.0})),
            record(json!({"time": 1.0, "b": "x,y"})),
        ];
        let table = SampleTable::from_records(&records, Schema::Union).unwrap();
        assert_eq!(table.available_columns(), ["time", "a", "b"]);
        assert_eq!(table.rows()[0][2], None);
        assert_eq!(fmt_cell(table.rows()[1][2].as_ref()), "\"x,y\"");

        assert!(SampleTable::from_records(&records, Schema::FirstRecord).is_err());
    }

    #[test]
    fn series_skips_missing_cells() {
        let records = [
            record(json!({"frequency": 10.0, "R": 1.0})),
            record(json!({"frequency": 11.0})),
            record(json!({"frequency": 12.0, "R": 3.0})),
        ];
        let table = SampleTable::from_records(&records, Schema::Union).unwrap();
        assert_eq!(table.series("frequency", "R"), (vec![10.0, 12.0], vec![1.0, 3.0]));
        assert_eq!(table.series("frequency", "nope"), (vec![], vec![]));
    }

    #[test]
    fn fmt_time_is_fixed_width() {
        let a = fmt_time(SystemTime::UNIX_EPOCH);
        let b = fmt_time(SystemTime::now());
        assert_eq!(a.len(), b.len());
        assert!(a.ends_with('Z'));
    }
}
