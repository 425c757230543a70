use std::env;

use anyhow::{Context, Result};
use log::info;
use mercurius::config::Config;
use mercurius::session::command::parse_date;
use mercurius::session::{Backtest, SessionBuilder};

/// Usage: session_server <control_port> <start> <end> <symbols> <benchmark>
///
/// Symbols are comma-separated, dates are YYYY-MM-DD. Everything else comes from the
/// MERCURIUS_* environment variables.
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 6 {
        anyhow::bail!("usage: {} <control_port> <start> <end> <symbols> <benchmark>", args[0]);
    }

    let control_port: u16 = args[1].parse().context("invalid control port")?;
    let start = parse_date(&args[2])?;
    let end = parse_date(&args[3])?;
    let symbols: Vec<String> = args[4].split(',').map(str::to_string).collect();
    let benchmark = args[5].clone();

    let config = Config::from_env()?;
    let session = SessionBuilder::new(1, Backtest::new(start, end, symbols, benchmark))
        .with_config(config)
        .with_control_port(control_port)
        .manual()
        .await?;

    let stop = session.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("SESSION: Interrupted");
            stop.cancel();
        }
    });

    session.run().await?;
    Ok(())
}
