use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// A single query result row, column name to value.
pub type Row = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    UInteger(u64),
    Boolean(bool),
    String(String),
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInteger(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum PointError {
    #[error("measurement name is empty")]
    EmptyMeasurement,
    #[error("point for measurement {0} has no fields")]
    NoFields(String),
    #[error("field {0} is not a finite float")]
    NonFiniteField(String),
    #[error("timestamp can't be represented in nanoseconds")]
    TimestampOutOfRange,
    #[error("{0:?} contains a line break or ends with a backslash")]
    UnencodableName(String),
}

/// A single timestamped measurement. Points can't be modified once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    // Nanoseconds since the unix epoch.
    timestamp: i64,
}

impl Point {
    pub fn builder(measurement: impl Into<String>) -> PointBuilder {
        PointBuilder {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: None,
        }
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

pub struct PointBuilder {
    measurement: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<DateTime<Utc>>,
}

impl PointBuilder {
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        // Line protocol has no way to express an empty tag value.
        if !value.is_empty() {
            self.tags.insert(key.into(), value);
        }
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Result<Point, PointError> {
        if self.measurement.is_empty() {
            return Err(PointError::EmptyMeasurement);
        }
        if self.fields.is_empty() {
            return Err(PointError::NoFields(self.measurement));
        }
        check_name(&self.measurement)?;
        for (key, value) in &self.tags {
            check_name(key)?;
            check_name(value)?;
        }
        for (key, value) in &self.fields {
            check_name(key)?;
            if let FieldValue::Float(v) = value {
                if !v.is_finite() {
                    return Err(PointError::NonFiniteField(key.clone()));
                }
            }
        }
        let timestamp = self
            .timestamp
            .unwrap_or_else(Utc::now)
            .timestamp_nanos_opt()
            .ok_or(PointError::TimestampOutOfRange)?;

        Ok(Point {
            measurement: self.measurement,
            tags: self.tags,
            fields: self.fields,
            timestamp,
        })
    }
}

// Line protocol has no escape for line breaks, and a trailing backslash
// would escape the delimiter written after it.
fn check_name(name: &str) -> Result<(), PointError> {
    if name.contains(['\n', '\r']) || name.ends_with('\\') {
        return Err(PointError::UnencodableName(name.to_string()));
    }
    Ok(())
}

/// Most recent point of a metric, as returned by the latest-point lookup.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestDataPoint {
    // Milliseconds since the unix epoch.
    pub timestamp: i64,
    pub symbol: String,
    pub interval: String,
}
