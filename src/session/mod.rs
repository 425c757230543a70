//! Sessions drive executions of one backtest definition.
//!
//! A [ManualSession] is controlled over a socket: the caller creates an execution, configures it,
//! runs it and polls the portfolio while it runs. At most one execution is active at a time. The
//! run happens on its own task and reports back to the control loop, all session state is owned by
//! the loop.
//!
//! An [AutomatedSession] has no socket, it runs a list of executions back to back.
//!
//! ```no_run
//! # async fn example() -> Result<(), mercurius::session::SessionError> {
//! use mercurius::session::{Backtest, SessionBuilder};
//! use time::macros::date;
//!
//! let backtest = Backtest::new(date!(2024 - 01 - 01), date!(2024 - 03 - 31), vec!["ABC".to_string()], "SPY");
//! let session = SessionBuilder::new(1, backtest).manual().await?;
//! println!("control port {}", session.port());
//! session.run().await
//! # }
//! ```
use std::sync::Arc;

use derive_more::{Display, Error};
use time::Date;

use crate::config::Config;
use crate::engine::{Engine, RandomEngine};
use crate::pool::{PoolError, WorkerPool};
use crate::repository::{ExecutionRepository, InMemoryRepository, PeriodRepository};
use crate::socket::{SocketBuilder, SocketError};
use crate::types::{ExecutionId, Frequency, SessionId};

mod automated;
pub mod command;
mod execution;
mod manual;

pub use automated::{AutomatedSession, ExecutionPlan};
pub use manual::ManualSession;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    Configuring,
    Configured,
    Running,
    Stopped,
}

/// Errors that end a session.
#[derive(Debug, Display, Error)]
pub enum SessionError {
    #[display("{_0}")]
    Pool(PoolError),
    #[display("control socket error: {_0}")]
    Socket(SocketError),
    #[display("failed to reply to {task}: {source}")]
    Reply { task: String, source: SocketError },
    #[display("engine failed to configure: {reason}")]
    EngineConfigure { reason: String },
    #[display("execution {id} failed: {reason}")]
    Execution { id: ExecutionId, reason: String },
    #[display("repository error: {reason}")]
    Repository { reason: String },
}

impl From<PoolError> for SessionError {
    fn from(value: PoolError) -> Self {
        SessionError::Pool(value)
    }
}

impl From<SocketError> for SessionError {
    fn from(value: SocketError) -> Self {
        SessionError::Socket(value)
    }
}

/// What every execution of a session runs over, unless the execution overrides it.
#[derive(Clone, Debug, PartialEq)]
pub struct Backtest {
    pub start: Date,
    pub end: Date,
    pub frequency: Frequency,
    pub symbols: Vec<String>,
    pub benchmark: String,
    pub initial_cash: f64,
}

impl Backtest {
    pub fn new(start: Date, end: Date, symbols: Vec<String>, benchmark: impl Into<String>) -> Self {
        Self {
            start,
            end,
            frequency: Frequency::Daily,
            symbols,
            benchmark: benchmark.into(),
            initial_cash: 100_000.0,
        }
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_initial_cash(mut self, initial_cash: f64) -> Self {
        self.initial_cash = initial_cash;
        self
    }
}

/// Collaborators shared by both kinds of session.
pub(crate) struct SessionContext {
    pub(crate) session_id: SessionId,
    pub(crate) config: Config,
    pub(crate) backtest: Backtest,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) executions: Arc<dyn ExecutionRepository>,
    pub(crate) periods: Arc<dyn PeriodRepository>,
}

pub struct SessionBuilder {
    session_id: SessionId,
    backtest: Backtest,
    config: Config,
    control_port: u16,
    engine: Option<Arc<dyn Engine>>,
    executions: Option<Arc<dyn ExecutionRepository>>,
    periods: Option<Arc<dyn PeriodRepository>>,
}

impl SessionBuilder {
    pub fn new(session_id: SessionId, backtest: Backtest) -> Self {
        Self {
            session_id,
            backtest,
            config: Config::default(),
            control_port: 0,
            engine: None,
            executions: None,
            periods: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Port the control socket listens on, zero scans the configured range.
    pub fn with_control_port(mut self, port: u16) -> Self {
        self.control_port = port;
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_executions(mut self, executions: Arc<dyn ExecutionRepository>) -> Self {
        self.executions = Some(executions);
        self
    }

    pub fn with_periods(mut self, periods: Arc<dyn PeriodRepository>) -> Self {
        self.periods = Some(periods);
        self
    }

    async fn context(self) -> Result<(SessionContext, u16), SessionError> {
        let pool = WorkerPool::new(&self.config).await?;
        let repository = Arc::new(InMemoryRepository::new());
        let executions = self
            .executions
            .unwrap_or_else(|| Arc::clone(&repository) as Arc<dyn ExecutionRepository>);
        let periods = self
            .periods
            .unwrap_or_else(|| repository as Arc<dyn PeriodRepository>);
        let engine = self
            .engine
            .unwrap_or_else(|| Arc::new(RandomEngine::new()) as Arc<dyn Engine>);

        let ctx = SessionContext {
            session_id: self.session_id,
            config: self.config,
            backtest: self.backtest,
            engine,
            pool: Arc::new(pool),
            executions,
            periods,
        };
        Ok((ctx, self.control_port))
    }

    /// Binds the control socket and the pool. Nothing is served until [ManualSession::run].
    pub async fn manual(self) -> Result<ManualSession, SessionError> {
        let (ctx, control_port) = self.context().await?;
        let control = SocketBuilder::new(&ctx.config.host)
            .with_port(control_port)
            .with_port_range(ctx.config.port_range)
            .replier()
            .await;
        let control = match control {
            Ok(control) => control,
            Err(e) => {
                let _ = ctx.pool.close();
                return Err(e.into());
            }
        };
        Ok(ManualSession::new(ctx, control))
    }

    pub async fn automated(self, plans: Vec<ExecutionPlan>) -> Result<AutomatedSession, SessionError> {
        let (ctx, _) = self.context().await?;
        Ok(AutomatedSession::new(ctx, plans))
    }
}
