#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mercurius::config::Config;
use mercurius::socket::{Replier, RequestOptions, Requester};
use mercurius::types::Order;
use mercurius::wire::{Envelope, FunctionTask};
use mercurius::worker;
use serde_json::Value;

use mercurius::session::command::ControlReply;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn config() -> Config {
    Config {
        poll_timeout: Duration::from_millis(100),
        request_timeout: Some(Duration::from_secs(5)),
        ..Config::default()
    }
}

/// Connects a worker to the broker at `port` and serves it in the background.
pub async fn spawn_worker<F>(port: u16, handler: F) -> Arc<Replier>
where
    F: Fn(FunctionTask) -> Result<Vec<Order>, String> + Send + Sync + 'static,
{
    let replier = Arc::new(worker::connect("127.0.0.1", port).await.unwrap());
    tokio::spawn(worker::serve(Arc::clone(&replier), handler));
    replier
}

pub fn buy_each(task: FunctionTask) -> Result<Vec<Order>, String> {
    Ok(task
        .symbols
        .iter()
        .map(|symbol| Order::market_buy(symbol.as_str(), 1.0))
        .collect())
}

pub async fn control(port: u16) -> Requester {
    Requester::new("127.0.0.1", port, true).await.unwrap()
}

pub async fn send(control: &Requester, task: &str, payload: Value) -> ControlReply {
    control
        .request(
            &Envelope::new(task, payload),
            RequestOptions::default().with_recv_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap()
}
