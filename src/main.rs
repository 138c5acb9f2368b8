use anyhow::Result;
use log::info;
use tsgateway::{GatewayConfig, Point, TimeSeriesGateway};

// Writes one point read from the command line and reads it back, e.g.
// `tsgateway price BTC 1m 42.5`. Connection settings come from TSGATEWAY_*.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (metric, symbol, interval, value) = match args.as_slice() {
        [metric, symbol, interval, value] => (metric, symbol, interval, value.parse::<f64>()?),
        _ => anyhow::bail!("usage: tsgateway <metric> <symbol> <interval> <value>"),
    };

    let config = GatewayConfig::from_env()?;
    let gateway = TimeSeriesGateway::open(&config)?;

    let point = Point::builder(metric.as_str())
        .tag("symbol", symbol.as_str())
        .tag("interval", interval.as_str())
        .field("value", value)
        .build()?;

    let result = async {
        gateway.write_data(&[point]).await?;
        let latest = gateway.query_latest_data_point(metric).await?;
        println!("{}", serde_json::to_string(&latest)?);
        Ok::<(), anyhow::Error>(())
    }
    .await;

    // The connection is released on the way out, whether or not the work succeeded.
    gateway.close().await?;
    info!("gateway closed");
    result
}
