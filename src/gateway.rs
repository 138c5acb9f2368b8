use chrono::DateTime;
use log::{debug, error};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use crate::{
    config::GatewayConfig,
    connection::Connection,
    metric::{LatestDataPoint, Point, Row},
    store::{influxdb::InfluxStore, StoreClient, StoreError},
};

// How far back the latest point lookup searches.
pub const LATEST_LOOKBACK: &str = "-1h";

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("error writing points: {0}")]
    Write(#[source] StoreError),
    #[error("error running query: {0}")]
    Query(#[source] StoreError),
    #[error("no data for metric {metric} in the lookback window")]
    EmptyResult { metric: String },
    #[error("malformed row for metric {metric}: {reason}")]
    MalformedRow { metric: String, reason: String },
    #[error("error closing store client: {0}")]
    Close(#[source] StoreError),
}

/// Write and query access to one bucket of a time-series store.
///
/// Every failure is logged once where it is detected and then returned to
/// the caller. Nothing is retried here.
pub struct TimeSeriesGateway<C: StoreClient> {
    client: C,
    bucket: String,
    closed: AtomicBool,
}

impl TimeSeriesGateway<InfluxStore> {
    /// Opens the shared connection and builds a gateway on top of it.
    pub fn open(config: &GatewayConfig) -> Result<Self, StoreError> {
        let connection = Connection::open(config)?;
        let store = InfluxStore::new(connection, config)?;
        Ok(Self::new(store, config.bucket.clone()))
    }
}

impl<C: StoreClient> TimeSeriesGateway<C> {
    pub fn new(client: C, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Enqueues `points` in order and flushes right away. Resolves once the
    /// points went through or failed, even if another write sent them.
    pub async fn write_data(&self, points: &[Point]) -> Result<(), GatewayError> {
        let result = match self.client.enqueue(points).await {
            Ok(ticket) => self.client.flush(ticket).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!("wrote {} points", points.len());
                Ok(())
            }
            Err(e) => {
                error!("error writing {} points: {}", points.len(), e);
                Err(GatewayError::Write(e))
            }
        }
    }

    /// Runs `query` as is and collects every row. The query is not checked or
    /// escaped, interpolating values safely is up to the caller.
    pub async fn query_data(&self, query: &str) -> Result<Vec<Row>, GatewayError> {
        self.client.query(query).await.map_err(|e| {
            error!("error running query {:?}: {}", query, e);
            GatewayError::Query(e)
        })
    }

    /// Looks up the most recent point of `metric` within the last hour.
    pub async fn query_latest_data_point(
        &self,
        metric: &str,
    ) -> Result<LatestDataPoint, GatewayError> {
        let query = latest_query(&self.bucket, metric);
        let result = match self.client.query(&query).await {
            Ok(rows) => match rows.first() {
                Some(row) => latest_from_row(metric, row),
                None => Err(GatewayError::EmptyResult {
                    metric: metric.to_string(),
                }),
            },
            Err(e) => Err(GatewayError::Query(e)),
        };
        if let Err(e) = &result {
            error!("error querying latest data point for {}: {}", metric, e);
        }
        result
    }

    /// Closes the store client. Only the first call reaches the client.
    pub async fn close(&self) -> Result<(), GatewayError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.client.close().await.map_err(|e| {
            error!("error closing store client: {}", e);
            GatewayError::Close(e)
        })
    }
}

fn latest_query(bucket: &str, metric: &str) -> String {
    format!(
        "from(bucket: \"{}\")\n  \
         |> range(start: {})\n  \
         |> filter(fn: (r) => r._measurement == \"{}\")\n  \
         |> group()\n  \
         |> sort(columns: [\"_time\"], desc: true)\n  \
         |> limit(n: 1)",
        escape_string(bucket),
        LATEST_LOOKBACK,
        escape_string(metric)
    )
}

// Escapes a value for use inside a Flux string literal.
fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn latest_from_row(metric: &str, row: &Row) -> Result<LatestDataPoint, GatewayError> {
    let malformed = |reason: String| GatewayError::MalformedRow {
        metric: metric.to_string(),
        reason,
    };
    let column = |name: &str| {
        row.get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(format!("missing string column {}", name)))
    };

    let time = column("_time")?;
    let timestamp = DateTime::parse_from_rfc3339(time)
        .map_err(|e| malformed(format!("invalid _time {:?}: {}", time, e)))?
        .timestamp_millis();

    Ok(LatestDataPoint {
        timestamp,
        symbol: column("symbol")?.to_string(),
        interval: column("interval")?.to_string(),
    })
}
