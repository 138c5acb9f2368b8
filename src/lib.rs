pub mod config;
pub mod connection;
pub mod encode;
pub mod gateway;
pub mod metric;
pub mod store;

pub use config::{GatewayConfig, WriteOptions};
pub use connection::Connection;
pub use gateway::{GatewayError, TimeSeriesGateway};
pub use metric::{FieldValue, LatestDataPoint, Point, Row};
pub use store::{influxdb::InfluxStore, StoreClient, StoreError, WriteTicket};
