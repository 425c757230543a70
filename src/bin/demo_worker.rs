use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use mercurius::types::Order;
use mercurius::worker;

/// Usage: demo_worker <host> <broker_port>
///
/// Buys one unit of every symbol it is called with, whatever the function.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        anyhow::bail!("usage: {} <host> <broker_port>", args[0]);
    }
    let host = args[1].clone();
    let port: u16 = args[2].parse().context("invalid broker port")?;

    let replier = Arc::new(worker::connect(&host, port).await?);
    worker::serve(replier, |task| {
        Ok(task
            .symbols
            .iter()
            .map(|symbol| Order::market_buy(symbol.as_str(), 1.0))
            .collect())
    })
    .await;
    Ok(())
}
