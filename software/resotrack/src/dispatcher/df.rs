//! Dataframe view of collected samples

use polars::prelude::*;

use super::{FieldValue, SampleTable};

impl SampleTable {
    /// Copy the table into a dataframe.
    ///
    /// Columns with only numbers become `f64`; any text makes the whole column a string column.
    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let columns = self
            .available_columns()
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let cells: Vec<Option<&FieldValue>> =
                    self.rows().iter().map(|row| row[j].as_ref()).collect();
                let numeric = cells
                    .iter()
                    .all(|c| !matches!(c, Some(FieldValue::Text(_))));
                if numeric {
                    let values: Vec<Option<f64>> =
                        cells.iter().map(|c| c.and_then(FieldValue::as_f64)).collect();
                    Column::new(name.as_str().into(), values)
                } else {
                    let values: Vec<Option<String>> = cells
                        .iter()
                        .map(|c| {
                            c.map(|v| match v {
                                FieldValue::Number(x) => x.to_string(),
                                FieldValue::Text(s) => s.clone(),
                            })
                        })
                        .collect();
                    Column::new(name.as_str().into(), values)
                }
            })
            .collect();
        DataFrame::new(columns)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dispatcher::{Record, Schema};

    #[test]
    fn mixed_columns() {
        let recs: Vec<Record> = [
            json!({"f": 1.0, "status": "Stable"}),
            json!({"f": 2.0, "status": "Tracking"}),
        ]
        .into_iter()
        .filter_map(|v| v.as_object().cloned())
        .collect();
        let table = SampleTable::from_records(&recs, Schema::Union).unwrap();
        let df = table.to_dataframe().unwrap();
        assert_eq!(df.shape(), (2, 2));
        assert_eq!(df.column("f").unwrap().dtype(), &DataType::Float64);
        assert_eq!(df.column("status").unwrap().dtype(), &DataType::String);
    }
}
