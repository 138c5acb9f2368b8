use log::{debug, info};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Client,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use crate::{config::GatewayConfig, store::StoreError};

const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Shared HTTP transport to the store.
///
/// Opened once while the process starts up and handed to whatever needs to
/// talk to the store. Clones share the same underlying connection pool.
/// `release` tears the transport down; it only takes effect the first time.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    client: RwLock<Option<Client>>,
    released: AtomicBool,
    url: String,
}

impl Connection {
    pub fn open(config: &GatewayConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        if !config.token.is_empty() {
            let mut value = HeaderValue::from_str(&format!("Token {}", config.token))
                .map_err(|_| StoreError::Connection("token is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let builder = Client::builder().default_headers(headers);
        let builder = if config.keep_alive {
            // A single idle connection per host, kept around between calls.
            builder
                .pool_max_idle_per_host(1)
                .pool_idle_timeout(None::<Duration>)
                .tcp_keepalive(TCP_KEEPALIVE)
        } else {
            builder.pool_max_idle_per_host(0)
        };
        let client = builder.build()?;

        info!(
            "opened connection to {} (keep_alive: {})",
            config.url, config.keep_alive
        );
        Ok(Self {
            inner: Arc::new(ConnectionInner {
                client: RwLock::new(Some(client)),
                released: AtomicBool::new(false),
                url: config.url.clone(),
            }),
        })
    }

    /// Returns a handle to the pooled client, or `Closed` once released.
    pub fn client(&self) -> Result<Client, StoreError> {
        match self.inner.client.read() {
            Ok(client) => client.as_ref().cloned().ok_or(StoreError::Closed),
            Err(_) => Err(StoreError::LockFailure),
        }
    }

    /// Drops the transport. Returns true only for the call that released it.
    pub fn release(&self) -> bool {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            debug!("connection to {} already released", self.inner.url);
            return false;
        }
        // With a poisoned lock the flag is still set and the pool goes away
        // with the last clone.
        if let Ok(mut client) = self.inner.client.write() {
            client.take();
        }
        info!("released connection to {}", self.inner.url);
        true
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }
}
