use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type ExecutionId = u64;
pub type SessionId = u64;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Order {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
}

impl Order {
    fn market(side: Side, symbol: impl Into<String>, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            price: None,
        }
    }

    fn limit(side: Side, symbol: impl Into<String>, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            quantity,
            price: Some(price),
        }
    }

    pub fn market_buy(symbol: impl Into<String>, quantity: f64) -> Self {
        Order::market(Side::Buy, symbol, quantity)
    }

    pub fn market_sell(symbol: impl Into<String>, quantity: f64) -> Self {
        Order::market(Side::Sell, symbol, quantity)
    }

    pub fn limit_buy(symbol: impl Into<String>, quantity: f64, price: f64) -> Self {
        Order::limit(Side::Buy, symbol, quantity, price)
    }

    pub fn limit_sell(symbol: impl Into<String>, quantity: f64, price: f64) -> Self {
        Order::limit(Side::Sell, symbol, quantity, price)
    }
}

/// Snapshot of the portfolio at one timestamp, as handed to algorithm functions.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Portfolio {
    pub timestamp: i64,
    pub cash: f64,
    pub positions: BTreeMap<String, f64>,
    pub value: f64,
}

/// One persisted row of results for an execution.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Period {
    pub execution_id: ExecutionId,
    pub timestamp: i64,
    pub value: f64,
    pub cash: f64,
    pub benchmark_value: f64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Daily,
    Weekly,
}

impl Frequency {
    pub fn days(&self) -> i64 {
        match self {
            Frequency::Daily => 1,
            Frequency::Weekly => 7,
        }
    }
}
