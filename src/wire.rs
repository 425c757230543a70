//! Messages exchanged over the sockets.
//!
//! Every request is an [Envelope]: a task name plus a payload that only the handler for that task
//! understands. The payload type defaults to a JSON value so a receiver can look at the task
//! before committing to a schema, senders can use any serializable type and avoid building the
//! intermediate value.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::algorithm::ResolvedParameter;
use crate::types::Order;

/// Dynamically-typed fields of a namespace value.
pub type Fields = serde_json::Map<String, Value>;

/// Task name for a call to an algorithm function on a worker.
pub const RUN_FUNCTION: &str = "run_function";

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Envelope<P = Value> {
    pub task: String,
    #[serde(default)]
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(task: impl Into<String>, payload: P) -> Self {
        Self {
            task: task.into(),
            payload,
        }
    }
}

impl Envelope<Value> {
    pub fn task(task: impl Into<String>) -> Self {
        Self::new(task, Value::Null)
    }

    pub fn parse<T>(&self) -> Result<T, serde_json::Error>
    where
        T: DeserializeOwned,
    {
        T::deserialize(&self.payload)
    }
}

/// Sent by the pool. Borrows everything so the portfolio is encoded once per cycle no matter how
/// many calls are made with it.
#[derive(Debug, Serialize)]
pub struct FunctionCall<'a> {
    pub function: &'a str,
    pub timestamp: i64,
    pub symbols: &'a [String],
    pub portfolio: &'a Value,
    pub parameters: &'a [ResolvedParameter],
}

/// The worker's view of a [FunctionCall].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct FunctionTask {
    pub function: String,
    pub timestamp: i64,
    pub symbols: Vec<String>,
    pub portfolio: Value,
    #[serde(default)]
    pub parameters: Vec<ResolvedParameter>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct FunctionResult {
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub error: Option<String>,
}

impl FunctionResult {
    pub fn orders(orders: Vec<Order>) -> Self {
        Self {
            orders,
            error: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            orders: Vec::new(),
            error: Some(reason.into()),
        }
    }
}
