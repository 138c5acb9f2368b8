use crate::metric::Row;
use csv::{ReaderBuilder, StringRecord};
use serde_json::{Number, Value};
use std::io::Read;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("error reading csv response: {0}")]
    Csv(#[from] csv::Error),
    #[error("store reported query error: {0}")]
    ErrorTable(String),
    #[error("invalid {datatype} value {value:?} in column {column}")]
    InvalidValue {
        column: String,
        datatype: String,
        value: String,
    },
}

// Column layout of the table currently being read. A response can hold
// several tables, each introduced by its own annotation rows and header.
#[derive(Default)]
struct Table {
    datatypes: Vec<String>,
    defaults: Vec<String>,
    header: Option<Vec<String>>,
    // Whether the first cell of every record is the annotation column.
    skip_first: bool,
}

impl Table {
    fn set_header(&mut self, record: &StringRecord) {
        self.skip_first = record.get(0).map_or(false, |c| c.is_empty());
        self.header = Some(self.cells(record));
    }

    fn cells(&self, record: &StringRecord) -> Vec<String> {
        let skip = if self.skip_first { 1 } else { 0 };
        record.iter().skip(skip).map(str::to_string).collect()
    }

    fn error_column(&self) -> Option<usize> {
        self.header
            .as_ref()
            .and_then(|header| header.iter().position(|c| c == "error"))
    }

    fn decode_row(&self, header: &[String], record: &StringRecord) -> Result<Row, DecodeError> {
        let cells = self.cells(record);
        let mut row = Row::new();
        for (i, column) in header.iter().enumerate() {
            let raw = cells.get(i).map(String::as_str).unwrap_or("");
            let datatype = self.datatypes.get(i).map(String::as_str).unwrap_or("string");
            let default = self.defaults.get(i).map(String::as_str).unwrap_or("");
            let value = decode_value(column, datatype, raw, default)?;
            row.insert(column.clone(), value);
        }
        Ok(row)
    }
}

/// Reads an annotated CSV query response into rows, in response order.
pub fn decode_rows<R: Read>(readable: R) -> Result<Vec<Row>, DecodeError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(readable);

    let mut rows = vec![];
    let mut table = Table::default();
    for record in reader.records() {
        let record = record?;
        if is_blank(&record) {
            table = Table::default();
            continue;
        }

        let first = record.get(0).unwrap_or("");
        if first.starts_with('#') {
            // Annotations after a header start the next table.
            if table.header.is_some() {
                table = Table::default();
            }
            let values: Vec<String> = record.iter().skip(1).map(str::to_string).collect();
            match first {
                "#datatype" => table.datatypes = values,
                "#default" => table.defaults = values,
                _ => {}
            }
            continue;
        }

        match &table.header {
            None => table.set_header(&record),
            Some(header) => {
                if let Some(i) = table.error_column() {
                    let cells = table.cells(&record);
                    let message = cells.get(i).cloned().unwrap_or_default();
                    return Err(DecodeError::ErrorTable(message));
                }
                rows.push(table.decode_row(header, &record)?);
            }
        }
    }
    Ok(rows)
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(str::is_empty)
}

fn decode_value(column: &str, datatype: &str, raw: &str, default: &str) -> Result<Value, DecodeError> {
    let raw = if raw.is_empty() { default } else { raw };
    if raw.is_empty() {
        return Ok(match datatype {
            "string" => Value::String(String::new()),
            _ => Value::Null,
        });
    }

    let invalid = || DecodeError::InvalidValue {
        column: column.to_string(),
        datatype: datatype.to_string(),
        value: raw.to_string(),
    };
    let value = match datatype {
        "long" => Value::from(raw.parse::<i64>().map_err(|_| invalid())?),
        "unsignedLong" => Value::from(raw.parse::<u64>().map_err(|_| invalid())?),
        "double" => {
            let v = raw.parse::<f64>().map_err(|_| invalid())?;
            // JSON has no representation for infinities or NaN.
            match Number::from_f64(v) {
                Some(n) => Value::Number(n),
                None => Value::String(raw.to_string()),
            }
        }
        "boolean" => Value::Bool(raw.parse::<bool>().map_err(|_| invalid())?),
        _ => Value::String(raw.to_string()),
    };
    Ok(value)
}
