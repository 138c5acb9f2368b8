use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::json;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{Mutex as AsyncMutex, Notify},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use super::{
    buffer::{Batch, WriteBuffer},
    StoreClient, StoreError, WriteTicket,
};
use crate::{
    config::GatewayConfig,
    connection::Connection,
    encode::{csv::decode_rows, line_protocol::encode_points},
    metric::{Point, Row},
};

// Failed line ranges remembered for flushes still waiting on their outcome.
const MAX_RECORDED_FAILURES: usize = 256;

/// Store client speaking the InfluxDB v2 HTTP API.
///
/// Points are encoded to line protocol as they are enqueued and sit in a
/// [`WriteBuffer`] until flushed, either explicitly, once `batch_size` lines
/// are pending, or by the periodic flusher when `flush_interval_ms > 0`.
/// Flushes never overlap: a flush waits for the one in progress and then
/// reports on the lines of its own ticket, even if that earlier flush is the
/// one that sent them.
pub struct InfluxStore {
    inner: Arc<StoreInner>,
    closed: AtomicBool,
    stop: Arc<Notify>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl InfluxStore {
    pub fn new(connection: Connection, config: &GatewayConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let inner = Arc::new(StoreInner::new(connection, config));
        let stop = Arc::new(Notify::new());

        let flusher = match config.write.flush_interval_ms {
            0 => None,
            period => {
                let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;
                let inner_clone = inner.clone();
                let stop_clone = stop.clone();
                Some(runtime.spawn(async move {
                    let mut ticker = interval(Duration::from_millis(period));
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    // The first tick fires right away.
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            biased;
                            _ = stop_clone.notified() => break,
                            _ = ticker.tick() => {
                                if let Err(e) = inner_clone.flush_all().await {
                                    error!("error flushing write buffer: {}", e);
                                }
                            }
                        }
                    }
                }))
            }
        };

        Ok(Self {
            inner,
            closed: AtomicBool::new(false),
            stop,
            flusher: Mutex::new(flusher),
        })
    }

    fn take_flusher(&self) -> Option<JoinHandle<()>> {
        match self.flusher.lock() {
            Ok(mut flusher) => flusher.take(),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl StoreClient for InfluxStore {
    async fn enqueue(&self, points: &[Point]) -> Result<WriteTicket, StoreError> {
        self.inner.enqueue(points).await
    }

    async fn flush(&self, ticket: WriteTicket) -> Result<(), StoreError> {
        self.inner.flush(ticket).await
    }

    async fn query(&self, query: &str) -> Result<Vec<Row>, StoreError> {
        self.inner.query(query).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(flusher) = self.take_flusher() {
            // A periodic flush in progress runs to the end and logs its outcome.
            self.stop.notify_one();
            if let Err(e) = flusher.await {
                debug!("periodic flusher ended abnormally: {}", e);
            }
        }
        let result = self.inner.flush_all().await;
        self.inner.connection.release();
        info!("closed store client for bucket {}", self.inner.bucket);
        result
    }
}

impl Drop for InfluxStore {
    fn drop(&mut self) {
        self.stop.notify_one();
        if let Some(flusher) = self.take_flusher() {
            flusher.abort();
        }
    }
}

struct Failure {
    start: u64,
    end: u64,
    message: String,
}

#[derive(Default)]
struct FlushLog {
    failures: VecDeque<Failure>,
}

impl FlushLog {
    fn record(&mut self, batch: &Batch, message: &str) {
        self.failures.push_back(Failure {
            start: batch.start,
            end: batch.end(),
            message: message.to_string(),
        });
        if self.failures.len() > MAX_RECORDED_FAILURES {
            self.failures.pop_front();
        }
    }

    // A retried batch keeps its range, so a later success clears the failure.
    fn clear(&mut self, batch: &Batch) {
        let (start, end) = (batch.start, batch.end());
        self.failures.retain(|f| f.start < start || f.end > end);
    }

    fn failure(&self, ticket: WriteTicket) -> Option<&str> {
        self.failures
            .iter()
            .rev()
            .find(|f| ticket.overlaps(f.start, f.end))
            .map(|f| f.message.as_str())
    }
}

struct StoreInner {
    connection: Connection,
    write_url: String,
    query_url: String,
    org: String,
    bucket: String,
    buffer: Mutex<WriteBuffer>,
    // Held for the whole of a flush, drain and sends included.
    flushing: AsyncMutex<FlushLog>,
}

impl StoreInner {
    fn new(connection: Connection, config: &GatewayConfig) -> Self {
        Self {
            connection,
            write_url: format!("{}/api/v2/write", config.base_url()),
            query_url: format!("{}/api/v2/query", config.base_url()),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            buffer: Mutex::new(WriteBuffer::new(&config.write)),
            flushing: AsyncMutex::new(FlushLog::default()),
        }
    }

    fn lock_buffer(&self) -> Result<MutexGuard<'_, WriteBuffer>, StoreError> {
        self.buffer.lock().map_err(|_| StoreError::LockFailure)
    }

    async fn enqueue(&self, points: &[Point]) -> Result<WriteTicket, StoreError> {
        if self.connection.is_released() {
            return Err(StoreError::Closed);
        }
        let lines = encode_points(points);
        let (ticket, full) = {
            let mut buffer = self.lock_buffer()?;
            let ticket = buffer.push(lines);
            (ticket, buffer.is_full())
        };
        if full {
            // The owners of the lines hear about a failure when they flush.
            if let Err(e) = self.flush_all().await {
                warn!("automatic flush at batch size failed: {}", e);
            }
        }
        Ok(ticket)
    }

    async fn flush(&self, ticket: WriteTicket) -> Result<(), StoreError> {
        let mut log = self.flushing.lock().await;
        self.send_buffered(&mut log).await?;
        match log.failure(ticket) {
            Some(message) => Err(StoreError::FlushFailed(message.to_string())),
            None => Ok(()),
        }
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        let mut log = self.flushing.lock().await;
        self.send_buffered(&mut log).await
    }

    async fn send_buffered(&self, log: &mut FlushLog) -> Result<(), StoreError> {
        let batches = self.lock_buffer()?.drain();

        let mut batches = batches.into_iter();
        while let Some(batch) = batches.next() {
            match self.send(&batch.lines).await {
                Ok(()) => log.clear(&batch),
                Err(e) => {
                    // Whatever wasn't sent waits for the next flush, if allowed.
                    let message = e.to_string();
                    let mut buffer = self.lock_buffer()?;
                    log.record(&batch, &message);
                    buffer.fail(batch);
                    for rest in batches {
                        log.record(&rest, &message);
                        buffer.requeue(rest);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn send(&self, lines: &[String]) -> Result<(), StoreError> {
        let client = self.connection.client()?;
        let response = client
            .post(&self.write_url)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "ns"),
            ])
            .body(lines.join("\n"))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(StoreError::Write { status, message });
        }

        debug!("wrote {} lines to bucket {}", lines.len(), self.bucket);
        Ok(())
    }

    async fn query(&self, query: &str) -> Result<Vec<Row>, StoreError> {
        let client = self.connection.client()?;
        let body = json!({
            "query": query,
            "type": "flux",
            "dialect": {
                "header": true,
                "delimiter": ",",
                "annotations": ["datatype", "group", "default"],
            },
        });
        let response = client
            .post(&self.query_url)
            .header(ACCEPT, "application/csv")
            .query(&[("org", self.org.as_str())])
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(StoreError::Query { status, message });
        }

        let bytes = response.bytes().await?;
        let rows = decode_rows(bytes.as_ref())?;
        debug!("query returned {} rows", rows.len());
        Ok(rows)
    }
}

#[cfg(test)]
pub mod tests {
    use chrono::{TimeZone, Utc};
    use log::Level;
    use serde_json::{json, Value};
    use std::time::Duration;

    use crate::{
        config::GatewayConfig,
        connection::Connection,
        encode::line_protocol::encode_points,
        metric::Point,
        store::{StoreClient, StoreError, WriteTicket},
        test::{
            capture_log::{capture, records_at},
            stub_server::{StubResponse, StubServer},
        },
    };

    use super::InfluxStore;

    // Nothing listens on port 1, requests fail with a connection error.
    const UNREACHABLE: &str = "http://127.0.0.1:1";

    fn config() -> GatewayConfig {
        GatewayConfig::new(UNREACHABLE, "token", "org", "bucket")
    }

    fn stub_config(server: &StubServer) -> GatewayConfig {
        GatewayConfig::new(&server.url, "token", "org", "bucket")
    }

    fn points(n: usize) -> Vec<Point> {
        symbols("BTC", n)
    }

    fn symbols(symbol: &str, n: usize) -> Vec<Point> {
        let time = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                Point::builder("price")
                    .tag("symbol", symbol)
                    .field("close", i as f64)
                    .timestamp(time)
                    .build()
                    .unwrap()
            })
            .collect()
    }

    fn open(config: &GatewayConfig) -> InfluxStore {
        let connection = Connection::open(config).unwrap();
        InfluxStore::new(connection, config).unwrap()
    }

    #[test]
    fn test_new_without_runtime() {
        let store = open(&config());
        assert_eq!(store.inner.write_url, "http://127.0.0.1:1/api/v2/write");
        assert_eq!(store.inner.query_url, "http://127.0.0.1:1/api/v2/query");

        let mut config = config();
        config.write.flush_interval_ms = 100;
        let connection = Connection::open(&config).unwrap();
        assert!(matches!(
            InfluxStore::new(connection, &config).err(),
            Some(StoreError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_periodic_flusher() {
        let mut config = config();
        config.write.flush_interval_ms = 10;
        let store = open(&config);
        assert!(store.flusher.lock().unwrap().is_some());

        store.close().await.unwrap();
        assert!(store.flusher.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_empty_buffer() {
        let store = open(&config());
        // No request is made, so the unreachable url doesn't matter.
        let ticket = store.enqueue(&[]).await.unwrap();
        assert!(ticket.is_empty());
        store.flush(ticket).await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_fails_fast() {
        let store = open(&config());
        let ticket = store.enqueue(&points(3)).await.unwrap();
        assert_eq!(ticket, WriteTicket { start: 0, end: 3 });
        assert_eq!(store.inner.buffer.lock().unwrap().pending_len(), 3);

        let result = store.flush(ticket).await;
        assert!(matches!(result, Err(StoreError::Http(_))));

        // Retries are disabled, the failed lines are gone.
        let buffer = store.inner.buffer.lock().unwrap();
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.retry_len(), 0);
    }

    #[tokio::test]
    async fn test_flush_holds_lines_for_retry() {
        let mut config = config();
        config.write.max_retries = 2;
        let store = open(&config);
        let ticket = store.enqueue(&points(3)).await.unwrap();

        assert!(store.flush(ticket).await.is_err());
        assert_eq!(store.inner.buffer.lock().unwrap().retry_len(), 3);
    }

    #[tokio::test]
    async fn test_enqueue_auto_flush() {
        capture();
        let mut config = config();
        config.write.batch_size = 2;
        let store = open(&config);

        let first = store.enqueue(&points(1)).await.unwrap();
        // Reaching batch_size triggers a flush, which can't reach the store.
        let second = store.enqueue(&points(1)).await.unwrap();
        assert_eq!(store.inner.buffer.lock().unwrap().pending_len(), 0);
        assert_eq!(records_at(Level::Warn).len(), 1);

        assert!(matches!(
            store.flush(first).await,
            Err(StoreError::FlushFailed(_))
        ));
        assert!(matches!(
            store.flush(second).await,
            Err(StoreError::FlushFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_write() {
        let server = StubServer::start(vec![]).await;
        let store = open(&stub_config(&server));

        let points = points(2);
        let ticket = store.enqueue(&points).await.unwrap();
        store.flush(ticket).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].target,
            "/api/v2/write?org=org&bucket=bucket&precision=ns"
        );
        assert_eq!(requests[0].header("authorization"), Some("Token token"));
        assert_eq!(requests[0].body, encode_points(&points).join("\n"));
    }

    #[tokio::test]
    async fn test_write_error_message() {
        let body = r#"{"code":"invalid","message":"unable to parse 'price close=x'"}"#;
        let server = StubServer::start(vec![StubResponse::new(400, body)]).await;
        let store = open(&stub_config(&server));

        let ticket = store.enqueue(&points(1)).await.unwrap();
        match store.flush(ticket).await {
            Err(StoreError::Write { status, message }) => {
                assert_eq!(status, 400);
                assert!(message.contains("unable to parse"));
            }
            other => panic!("expected write error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_flushes_share_failure() {
        let server =
            StubServer::start(vec![StubResponse::new(500, "nope").after_millis(300)]).await;
        let store = open(&stub_config(&server));

        let a = store.enqueue(&symbols("A", 1)).await.unwrap();
        let b = store.enqueue(&symbols("B", 1)).await.unwrap();
        let (result_a, result_b) = tokio::join!(store.flush(a), store.flush(b));

        // Whichever flush ran first sent both lines in one request.
        assert!(result_a.is_err());
        assert!(result_b.is_err());
        let errors: Vec<String> = [result_a, result_b]
            .into_iter()
            .filter_map(|r| r.err())
            .map(|e| e.to_string())
            .collect();
        assert!(errors.iter().all(|e| e.contains("500") && e.contains("nope")));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_leaves_nothing_behind() {
        let server = StubServer::start(vec![StubResponse::new(500, "nope")]).await;
        let mut config = stub_config(&server);
        config.write.batch_size = 2;
        let store = open(&config);

        let ticket = store.enqueue(&symbols("A", 3)).await.unwrap();
        assert!(matches!(
            store.flush(ticket).await,
            Err(StoreError::FlushFailed(_))
        ));

        let ticket = store.enqueue(&symbols("C", 1)).await.unwrap();
        store.flush(ticket).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[1].body.starts_with("price,symbol=C "));
        assert!(!requests[1].body.contains("symbol=A"));
    }

    #[tokio::test]
    async fn test_retried_lines_clear_failure() {
        let server = StubServer::start(vec![StubResponse::new(503, "busy")]).await;
        let mut config = stub_config(&server);
        config.write.max_retries = 1;
        let store = open(&config);

        let first = store.enqueue(&symbols("A", 1)).await.unwrap();
        assert!(store.flush(first).await.is_err());

        let second = store.enqueue(&symbols("B", 1)).await.unwrap();
        store.flush(second).await.unwrap();
        store.flush(first).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 3);
        assert!(requests[1].body.starts_with("price,symbol=A "));
        assert!(requests[2].body.starts_with("price,symbol=B "));
    }

    #[tokio::test]
    async fn test_close_waits_for_periodic_flush() {
        capture();
        let server =
            StubServer::start(vec![StubResponse::new(500, "nope").after_millis(400)]).await;
        let mut config = stub_config(&server);
        config.write.flush_interval_ms = 50;
        let store = open(&config);

        store.enqueue(&points(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        store.close().await.unwrap();

        let errors = records_at(Level::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("500"));
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_query() {
        let csv = "#datatype,string,long,dateTime:RFC3339,double,string,string,string,string\r\n\
#group,false,false,false,false,true,true,true,true\r\n\
#default,_result,,,,,,,\r\n\
,result,table,_time,_value,_field,_measurement,interval,symbol\r\n\
,,0,2025-01-15T10:00:00.123Z,42.5,close,price,1m,BTC\r\n\
,,1,2025-01-15T10:01:00Z,43,close,price,1m,ETH\r\n\
\r\n";
        let server = StubServer::start(vec![StubResponse::new(200, csv)]).await;
        let store = open(&stub_config(&server));

        let query = "from(bucket: \"bucket\") |> range(start: -5m)";
        let rows = store.query(query).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["result"], json!("_result"));
        assert_eq!(rows[0]["table"], json!(0));
        assert_eq!(rows[0]["_time"], json!("2025-01-15T10:00:00.123Z"));
        assert_eq!(rows[0]["_value"], json!(42.5));
        assert_eq!(rows[1]["symbol"], json!("ETH"));
        assert_eq!(rows[1]["_value"], json!(43.0));

        let requests = server.requests();
        assert_eq!(requests[0].target, "/api/v2/query?org=org");
        assert_eq!(requests[0].header("accept"), Some("application/csv"));
        let body: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["query"], json!(query));
        assert_eq!(body["type"], json!("flux"));
    }

    #[tokio::test]
    async fn test_query_error_message() {
        let body = r#"{"code":"invalid","message":"compilation failed"}"#;
        let server = StubServer::start(vec![StubResponse::new(400, body)]).await;
        let store = open(&stub_config(&server));

        match store.query("fro(").await {
            Err(StoreError::Query { status, message }) => {
                assert_eq!(status, 400);
                assert!(message.contains("compilation failed"));
            }
            other => panic!("expected query error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_query_unreachable() {
        let store = open(&config());
        let result = store.query("from(bucket: \"bucket\") |> range(start: -1h)").await;
        assert!(matches!(result, Err(StoreError::Http(_))));
    }

    #[tokio::test]
    async fn test_close_releases_once() {
        let config = config();
        let connection = Connection::open(&config).unwrap();
        let store = InfluxStore::new(connection.clone(), &config).unwrap();

        store.close().await.unwrap();
        assert!(connection.is_released());
        store.close().await.unwrap();

        assert!(matches!(
            store.enqueue(&points(1)).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.query("buckets()").await,
            Err(StoreError::Closed)
        ));
    }
}
