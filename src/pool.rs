//! Runs an [Algorithm] against remote workers.
//!
//! The pool listens on two sockets. Workers dial the broker socket and receive one request per
//! function call, they dial the namespace socket to share state between the functions of one
//! cycle. Both ports are handed to whoever launches the workers by [WorkerPool::configure].
//!
//! One call to [WorkerPool::process] is one cycle: the namespace is flushed, then every function
//! runs in stage order. A failure anywhere discards the orders of the whole cycle, the caller never
//! sees a partial set.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use derive_more::{Display, Error};
use futures::future::try_join_all;
use log::{debug, info};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::algorithm::{Algorithm, AlgorithmError, AlgorithmFunction, FunctionParameters, ParameterOverrides, ResolvedParameter};
use crate::config::Config;
use crate::namespace::{self, Namespace};
use crate::socket::{ignore_closed, RequestOptions, Replier, Requester, SocketBuilder, SocketError};
use crate::types::{Order, Portfolio};
use crate::wire::{Envelope, FunctionCall, FunctionResult, RUN_FUNCTION};

#[derive(Debug, Display, Error)]
pub enum PoolError {
    #[display("no algorithm installed")]
    NoAlgorithm,
    #[display("cycle cancelled")]
    Cancelled,
    #[display("worker failed in {function}: {reason}")]
    Worker { function: String, reason: String },
    #[display("request for {function} failed: {source}")]
    Request { function: String, source: SocketError },
    #[display("{_0}")]
    Algorithm(AlgorithmError),
    #[display("{_0}")]
    Socket(SocketError),
    #[display("failed to encode portfolio: {_0}")]
    Encode(serde_json::Error),
}

impl From<AlgorithmError> for PoolError {
    fn from(value: AlgorithmError) -> Self {
        PoolError::Algorithm(value)
    }
}

impl From<SocketError> for PoolError {
    fn from(value: SocketError) -> Self {
        PoolError::Socket(value)
    }
}

type Resolved = HashMap<String, Vec<ResolvedParameter>>;

#[derive(Debug)]
pub struct WorkerPool {
    broker: Requester,
    namespace_socket: Arc<Replier>,
    namespace: Arc<Namespace>,
    algorithm: RwLock<Option<Arc<Algorithm>>>,
    parameters: RwLock<Arc<Resolved>>,
    opts: RequestOptions,
}

impl WorkerPool {
    /// Binds both sockets from the configured range and starts serving the namespace.
    pub async fn new(config: &Config) -> Result<Self, PoolError> {
        let broker = SocketBuilder::new(&config.host)
            .with_port_range(config.port_range)
            .requester()
            .await?;
        let namespace_socket = SocketBuilder::new(&config.host)
            .with_port_range(config.port_range)
            .replier()
            .await?;
        let namespace_socket = Arc::new(namespace_socket);
        let namespace = Arc::new(Namespace::default());
        tokio::spawn(namespace::serve(
            Arc::clone(&namespace),
            Arc::clone(&namespace_socket),
        ));

        let mut opts = RequestOptions::default();
        if let Some(timeout) = config.request_timeout {
            opts = opts.with_send_timeout(timeout).with_recv_timeout(timeout);
        }

        info!(
            "POOL: Broker on {}, namespace on {}",
            broker.port(),
            namespace_socket.port()
        );
        Ok(Self {
            broker,
            namespace_socket,
            namespace,
            algorithm: RwLock::new(None),
            parameters: RwLock::new(Arc::default()),
            opts,
        })
    }

    /// Ports that workers must dial: broker first, namespace second.
    pub fn configure(&self) -> (u16, u16) {
        (self.broker.port(), self.namespace_socket.port())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Number of workers currently connected to the broker.
    pub fn workers(&self) -> usize {
        self.broker.peers()
    }

    pub fn algorithm(&self) -> Option<Arc<Algorithm>> {
        self.algorithm
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs `algorithm`, redeclares the namespace and resets parameters to the defaults.
    pub fn set_algorithm(&self, algorithm: Algorithm) {
        self.namespace.declare(algorithm.namespaces().iter().cloned());
        self.store_parameters(algorithm.defaults());
        *self.algorithm.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(algorithm));
    }

    /// Resolves every function's parameters with `overrides` applied, later cycles send these.
    pub fn resolve_parameters(&self, overrides: &ParameterOverrides) -> Result<Vec<FunctionParameters>, PoolError> {
        let algorithm = self.algorithm().ok_or(PoolError::NoAlgorithm)?;
        let resolved = algorithm.resolve(overrides)?;
        self.store_parameters(resolved.clone());
        Ok(resolved)
    }

    fn store_parameters(&self, resolved: Vec<FunctionParameters>) {
        let map: Resolved = resolved
            .into_iter()
            .map(|entry| (entry.function, entry.parameters))
            .collect();
        *self.parameters.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
    }

    /// Runs one cycle at `timestamp` and returns every order produced, first stage first.
    pub async fn process(
        &self,
        cancel: &CancellationToken,
        timestamp: i64,
        symbols: &[String],
        portfolio: &Portfolio,
    ) -> Result<Vec<Order>, PoolError> {
        let algorithm = self.algorithm().ok_or(PoolError::NoAlgorithm)?;
        let parameters = Arc::clone(&self.parameters.read().unwrap_or_else(PoisonError::into_inner));

        debug!("POOL: Cycle at {} with {} workers connected", timestamp, self.workers());
        self.namespace.flush();
        let portfolio = serde_json::to_value(portfolio).map_err(PoolError::Encode)?;

        let cycle = async {
            let mut orders = Vec::new();
            for stage in algorithm.stages() {
                for function in stage {
                    let params = parameters
                        .get(&function.name)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    let mut produced = if function.parallel {
                        self.fan_out(function, timestamp, symbols, &portfolio, params)
                            .await?
                    } else {
                        self.call(&function.name, timestamp, symbols, &portfolio, params)
                            .await?
                    };
                    orders.append(&mut produced);
                }
            }
            Ok::<_, PoolError>(orders)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("POOL: Cycle at {} cancelled", timestamp);
                Err(PoolError::Cancelled)
            }
            res = cycle => res,
        }
    }

    /// One request per symbol, all in flight at once. The first failure drops the rest.
    async fn fan_out(
        &self,
        function: &AlgorithmFunction,
        timestamp: i64,
        symbols: &[String],
        portfolio: &Value,
        parameters: &[ResolvedParameter],
    ) -> Result<Vec<Order>, PoolError> {
        let accumulator = Mutex::new(Vec::new());
        let calls = symbols.iter().map(|symbol| {
            let accumulator = &accumulator;
            async move {
                let orders = self
                    .call(
                        &function.name,
                        timestamp,
                        std::slice::from_ref(symbol),
                        portfolio,
                        parameters,
                    )
                    .await?;
                accumulator
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(orders);
                Ok::<(), PoolError>(())
            }
        });
        try_join_all(calls).await?;
        Ok(accumulator.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    async fn call(
        &self,
        function: &str,
        timestamp: i64,
        symbols: &[String],
        portfolio: &Value,
        parameters: &[ResolvedParameter],
    ) -> Result<Vec<Order>, PoolError> {
        let request = Envelope::new(
            RUN_FUNCTION,
            FunctionCall {
                function,
                timestamp,
                symbols,
                portfolio,
                parameters,
            },
        );
        let result: FunctionResult = self
            .broker
            .request(&request, self.opts)
            .await
            .map_err(|source| PoolError::Request {
                function: function.to_string(),
                source,
            })?;
        match result.error {
            Some(reason) => Err(PoolError::Worker {
                function: function.to_string(),
                reason,
            }),
            None => Ok(result.orders),
        }
    }

    /// Closes both sockets, the namespace service exits once its socket is closed. Safe to call
    /// more than once.
    pub fn close(&self) -> Result<(), PoolError> {
        ignore_closed(self.broker.close())?;
        ignore_closed(self.namespace_socket.close())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_that_process_without_algorithm_fails() {
        let pool = WorkerPool::new(&Config::default()).await.unwrap();
        let res = pool
            .process(
                &CancellationToken::new(),
                0,
                &["ABC".to_string()],
                &Portfolio::default(),
            )
            .await;
        assert!(matches!(res, Err(PoolError::NoAlgorithm)));
        pool.close().unwrap();
    }

    #[tokio::test]
    async fn test_that_set_algorithm_declares_namespace() {
        let pool = WorkerPool::new(&Config::default()).await.unwrap();
        let algorithm = Algorithm::new(
            vec![AlgorithmFunction::new("signal")],
            vec!["signals".to_string(), "risk".to_string()],
        )
        .unwrap();
        pool.set_algorithm(algorithm);

        assert_eq!(pool.namespace().keys(), vec!["risk".to_string(), "signals".to_string()]);
        let (broker, namespace) = pool.configure();
        assert_ne!(broker, namespace);
        pool.close().unwrap();
    }

    #[tokio::test]
    async fn test_that_close_twice_is_tolerated() {
        let pool = WorkerPool::new(&Config::default()).await.unwrap();
        assert!(pool.close().is_ok());
        assert!(pool.close().is_ok());
    }
}
