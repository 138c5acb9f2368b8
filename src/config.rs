use std::env;
use thiserror::Error;

// Batch size the store client uses when left to its own defaults.
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_RETRY_LINES: usize = 32_000;

pub const URL_VAR: &str = "TSGATEWAY_URL";
pub const TOKEN_VAR: &str = "TSGATEWAY_TOKEN";
pub const ORG_VAR: &str = "TSGATEWAY_ORG";
pub const BUCKET_VAR: &str = "TSGATEWAY_BUCKET";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // Base url of the store, e.g. http://localhost:8086.
    pub url: String,
    pub token: String,
    pub org: String,
    // Bucket written to and queried by the gateway.
    pub bucket: String,
    // Reuse one pooled connection across calls instead of connecting per request.
    pub keep_alive: bool,
    pub write: WriteOptions,
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    // Number of buffered lines that triggers an automatic flush.
    pub batch_size: usize,
    // Period of the background flush in milliseconds, 0 disables it.
    pub flush_interval_ms: u64,
    // Upper bound on lines held for another attempt after a failed flush.
    pub max_retry_lines: usize,
    // Number of times a failed batch is attempted again, 0 fails fast.
    pub max_retries: u32,
}

impl Default for WriteOptions {
    // Flushing is left entirely to the caller: the batch threshold sits above
    // the store default and the periodic flush is off. Writes never retry.
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE + 1,
            flush_interval_ms: 0,
            max_retry_lines: DEFAULT_MAX_RETRY_LINES,
            max_retries: 0,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: String::new(),
            org: String::new(),
            bucket: String::new(),
            keep_alive: true,
            write: WriteOptions::default(),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("url is empty")]
    EmptyUrl,
    #[error("url {0} must start with http:// or https://")]
    InvalidUrl(String),
    #[error("org is empty")]
    EmptyOrg,
    #[error("bucket is empty")]
    EmptyBucket,
    #[error("batch_size must be greater than zero")]
    BatchSizeError,
    #[error("environment variable {0} is not set")]
    MissingVar(&'static str),
}

impl GatewayConfig {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        org: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            org: org.into(),
            bucket: bucket.into(),
            ..Default::default()
        }
    }

    /// Reads connection settings from `TSGATEWAY_*` variables. Everything
    /// else keeps its default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |name: &'static str| env::var(name).map_err(|_| ConfigError::MissingVar(name));
        let config = Self::new(var(URL_VAR)?, var(TOKEN_VAR)?, var(ORG_VAR)?, var(BUCKET_VAR)?);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(self.url.clone()));
        }
        if self.org.is_empty() {
            return Err(ConfigError::EmptyOrg);
        }
        if self.bucket.is_empty() {
            return Err(ConfigError::EmptyBucket);
        }
        if self.write.batch_size == 0 {
            return Err(ConfigError::BatchSizeError);
        }
        Ok(())
    }

    // Base url without a trailing slash, ready for appending api paths.
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}
