//! Backtest engines.
//!
//! The session only drives an [Engine]: it configures it, runs it against a pool and collects the
//! periods it produced. [RandomEngine] generates its own prices so a session can run without any
//! market data.
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use rand::thread_rng;
use rand_distr::{Distribution, Uniform};
use time::Date;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::pool::{PoolError, WorkerPool};
use crate::types::{ExecutionId, Frequency, Order, Period, Portfolio, Side};

#[derive(Clone, Debug, PartialEq)]
pub struct BacktestParams {
    pub execution_id: ExecutionId,
    pub start: Date,
    pub end: Date,
    pub symbols: Vec<String>,
    pub benchmark: String,
    pub frequency: Frequency,
    pub initial_cash: f64,
}

impl BacktestParams {
    /// Every date the backtest steps through, `start` and `end` included when they fall on a step.
    pub fn dates(&self) -> Vec<Date> {
        let step = time::Duration::days(self.frequency.days());
        let mut dates = Vec::new();
        let mut date = self.start;
        while date <= self.end {
            dates.push(date);
            match date.checked_add(step) {
                Some(next) => date = next,
                None => break,
            }
        }
        dates
    }
}

pub fn timestamp(date: Date) -> i64 {
    date.midnight().assume_utc().unix_timestamp()
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn configure(&self, params: &BacktestParams) -> Result<()>;
    /// Runs to the last date, sending the portfolio after every date. Returns early with an error
    /// once `cancel` fires.
    async fn run_backtest(
        &self,
        cancel: CancellationToken,
        params: &BacktestParams,
        pool: &WorkerPool,
        snapshots: &watch::Sender<Option<Portfolio>>,
    ) -> Result<()>;
    async fn get_result(&self, execution_id: ExecutionId) -> Result<Vec<Period>>;
    async fn stop(&self) -> Result<()>;
    async fn ingest(&self, symbols: &[String]) -> Result<()>;
    async fn download_ingestion(&self) -> Result<Vec<u8>>;
}

#[derive(Debug)]
struct Prices {
    execution_id: ExecutionId,
    dates: Vec<Date>,
    symbols: HashMap<String, Vec<f64>>,
    benchmark: Vec<f64>,
}

impl Prices {
    fn generate(params: &BacktestParams) -> Self {
        let dates = params.dates();
        let price_dist = Uniform::new(90.0, 100.0);
        let mut rng = thread_rng();

        let mut series = |len: usize| -> Vec<f64> { (0..len).map(|_| price_dist.sample(&mut rng)).collect() };
        let symbols = params
            .symbols
            .iter()
            .map(|symbol| (symbol.clone(), series(dates.len())))
            .collect();
        let benchmark = series(dates.len());

        Self {
            execution_id: params.execution_id,
            dates,
            symbols,
            benchmark,
        }
    }

    fn price(&self, symbol: &str, pos: usize) -> Option<f64> {
        self.symbols.get(symbol).and_then(|series| series.get(pos)).copied()
    }
}

/// Every symbol trades at a uniform random price between 90 and 100 on each date.
#[derive(Debug, Default)]
pub struct RandomEngine {
    prices: Mutex<Option<Arc<Prices>>>,
    periods: Mutex<HashMap<ExecutionId, Vec<Period>>>,
    ingested: Mutex<BTreeSet<String>>,
    stopped: AtomicBool,
}

impl RandomEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn value(portfolio: &Portfolio, prices: &Prices, pos: usize) -> f64 {
        portfolio.cash
            + portfolio
                .positions
                .iter()
                .map(|(symbol, qty)| qty * prices.price(symbol, pos).unwrap_or(0.0))
                .sum::<f64>()
    }

    fn execute(portfolio: &mut Portfolio, order: &Order, price: f64) {
        let fills = match (order.side, order.price) {
            (_, None) => true,
            (Side::Buy, Some(limit)) => price <= limit,
            (Side::Sell, Some(limit)) => price >= limit,
        };
        if !fills {
            return;
        }

        let held = portfolio.positions.get(&order.symbol).copied().unwrap_or(0.0);
        match order.side {
            Side::Buy => {
                let cost = order.quantity * price;
                if cost > portfolio.cash {
                    warn!("ENGINE: Insufficient cash for {} {}", order.quantity, order.symbol);
                    return;
                }
                portfolio.cash -= cost;
                portfolio.positions.insert(order.symbol.clone(), held + order.quantity);
            }
            Side::Sell => {
                if order.quantity > held {
                    warn!("ENGINE: Insufficient position for {} {}", order.quantity, order.symbol);
                    return;
                }
                portfolio.cash += order.quantity * price;
                if order.quantity == held {
                    portfolio.positions.remove(&order.symbol);
                } else {
                    portfolio.positions.insert(order.symbol.clone(), held - order.quantity);
                }
            }
        }
    }
}

#[async_trait]
impl Engine for RandomEngine {
    async fn configure(&self, params: &BacktestParams) -> Result<()> {
        if params.start > params.end {
            bail!("start {} is after end {}", params.start, params.end);
        }
        if params.initial_cash <= 0.0 {
            bail!("initial cash must be positive");
        }
        let prices = Prices::generate(params);
        info!(
            "ENGINE: Configured execution {} over {} dates",
            params.execution_id,
            prices.dates.len()
        );
        *self.prices.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(prices));
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run_backtest(
        &self,
        cancel: CancellationToken,
        params: &BacktestParams,
        pool: &WorkerPool,
        snapshots: &watch::Sender<Option<Portfolio>>,
    ) -> Result<()> {
        let prices = self
            .prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .filter(|prices| prices.execution_id == params.execution_id)
            .ok_or_else(|| anyhow!("execution {} is not configured", params.execution_id))?;

        let mut portfolio = Portfolio {
            cash: params.initial_cash,
            value: params.initial_cash,
            ..Portfolio::default()
        };
        let mut periods = Vec::with_capacity(prices.dates.len());
        let benchmark_base = prices.benchmark.first().copied().unwrap_or(1.0);

        for (pos, date) in prices.dates.iter().enumerate() {
            if self.stopped.load(Ordering::SeqCst) {
                bail!("engine stopped");
            }
            if cancel.is_cancelled() {
                return Err(PoolError::Cancelled.into());
            }

            portfolio.timestamp = timestamp(*date);
            portfolio.value = Self::value(&portfolio, &prices, pos);

            let orders = pool
                .process(&cancel, portfolio.timestamp, &params.symbols, &portfolio)
                .await?;
            debug!("ENGINE: {} orders on {}", orders.len(), date);
            for order in &orders {
                match prices.price(&order.symbol, pos) {
                    Some(price) => Self::execute(&mut portfolio, order, price),
                    None => warn!("ENGINE: No price for {}", order.symbol),
                }
            }
            portfolio.value = Self::value(&portfolio, &prices, pos);

            periods.push(Period {
                execution_id: params.execution_id,
                timestamp: portfolio.timestamp,
                value: portfolio.value,
                cash: portfolio.cash,
                benchmark_value: params.initial_cash * prices.benchmark[pos] / benchmark_base,
            });
            snapshots.send_replace(Some(portfolio.clone()));
        }

        info!("ENGINE: Execution {} finished", params.execution_id);
        self.periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(params.execution_id, periods);
        Ok(())
    }

    async fn get_result(&self, execution_id: ExecutionId) -> Result<Vec<Period>> {
        let periods = self.periods.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(periods.get(&execution_id).cloned().unwrap_or_default())
    }

    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ingest(&self, symbols: &[String]) -> Result<()> {
        self.ingested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(symbols.iter().cloned());
        Ok(())
    }

    async fn download_ingestion(&self) -> Result<Vec<u8>> {
        let ingested = self.ingested.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(serde_json::to_vec(&*ingested)?)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;

    fn params() -> BacktestParams {
        BacktestParams {
            execution_id: 1,
            start: date!(2024 - 01 - 01),
            end: date!(2024 - 01 - 10),
            symbols: vec!["ABC".to_string()],
            benchmark: "SPY".to_string(),
            frequency: Frequency::Daily,
            initial_cash: 1000.0,
        }
    }

    #[test]
    fn test_that_dates_step_by_frequency() {
        let mut weekly = params();
        weekly.frequency = Frequency::Weekly;
        assert_eq!(params().dates().len(), 10);
        assert_eq!(
            weekly.dates(),
            vec![date!(2024 - 01 - 01), date!(2024 - 01 - 08)]
        );
    }

    #[test]
    fn test_that_orders_respect_cash_and_positions() {
        let mut portfolio = Portfolio {
            cash: 100.0,
            ..Portfolio::default()
        };
        RandomEngine::execute(&mut portfolio, &Order::market_buy("ABC", 2.0), 95.0);
        assert_eq!(portfolio.cash, 100.0);

        RandomEngine::execute(&mut portfolio, &Order::market_buy("ABC", 1.0), 95.0);
        assert_eq!(portfolio.positions.get("ABC"), Some(&1.0));

        RandomEngine::execute(&mut portfolio, &Order::limit_sell("ABC", 1.0, 99.0), 95.0);
        assert_eq!(portfolio.positions.get("ABC"), Some(&1.0));

        RandomEngine::execute(&mut portfolio, &Order::market_sell("ABC", 1.0), 96.0);
        assert!(portfolio.positions.is_empty());
        assert_eq!(portfolio.cash, 101.0);
    }

    #[tokio::test]
    async fn test_that_inverted_dates_fail_to_configure() {
        let engine = RandomEngine::new();
        let mut inverted = params();
        inverted.end = date!(2023 - 12 - 01);
        assert!(engine.configure(&inverted).await.is_err());
    }

    #[tokio::test]
    async fn test_that_ingested_symbols_are_downloaded() {
        let engine = RandomEngine::new();
        engine
            .ingest(&["BCD".to_string(), "ABC".to_string()])
            .await
            .unwrap();
        let bytes = engine.download_ingestion().await.unwrap();
        let symbols: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(symbols, vec!["ABC".to_string(), "BCD".to_string()]);
    }
}
