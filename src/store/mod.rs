use async_trait::async_trait;
use thiserror::Error;

use crate::{
    config::ConfigError,
    encode::csv::DecodeError,
    metric::{Point, Row},
};

pub mod buffer;
pub mod influxdb;

/// Range of buffered lines that belong to one `enqueue` call, counted over
/// every line the client has accepted. Passed back to `flush` so the caller
/// learns whether its own lines made it to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteTicket {
    pub start: u64,
    pub end: u64,
}

impl WriteTicket {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        !self.is_empty() && self.start < end && start < self.end
    }
}

/// Capability the gateway needs from a time-series store.
///
/// Implementations are shared by every caller of the gateway, so they must
/// be safe to use concurrently.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Adds points to the write buffer, keeping their order.
    async fn enqueue(&self, points: &[Point]) -> Result<WriteTicket, StoreError>;
    /// Sends everything buffered so far. Waits for any flush already in
    /// progress and fails if the lines of `ticket` could not be written,
    /// whichever flush sent them.
    async fn flush(&self, ticket: WriteTicket) -> Result<(), StoreError>;
    /// Runs a store native query and collects every row.
    async fn query(&self, query: &str) -> Result<Vec<Row>, StoreError>;
    /// Flushes what is left and releases the transport.
    async fn close(&self) -> Result<(), StoreError>;
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid config: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("http error: {0}")]
    Http(#[source] Box<reqwest::Error>),
    #[error("write failed with status {status}: {message}")]
    Write { status: u16, message: String },
    #[error("query failed with status {status}: {message}")]
    Query { status: u16, message: String },
    #[error("lines were not written: {0}")]
    FlushFailed(String),
    #[error("error decoding query response: {0}")]
    Decode(#[from] DecodeError),
    #[error("periodic flush requires a running tokio runtime")]
    NoRuntime,
    #[error("store is closed")]
    Closed,
    #[error("failed to get write buffer lock")]
    LockFailure,
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Http(Box::new(err))
    }
}
