use log::{info, warn};
use time::Date;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::algorithm::{Algorithm, ParameterOverrides};
use crate::repository::{ExecutionRecord, ExecutionStatus, NewExecution};
use crate::types::ExecutionId;

use super::execution;
use super::{SessionContext, SessionError};

/// One execution of an automated session. Absent fields fall back to the session's backtest.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    pub algorithm: Algorithm,
    pub start: Option<Date>,
    pub end: Option<Date>,
    pub symbols: Option<Vec<String>>,
    pub benchmark: Option<String>,
    pub parameters: ParameterOverrides,
}

impl ExecutionPlan {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            start: None,
            end: None,
            symbols: None,
            benchmark: None,
            parameters: ParameterOverrides::new(),
        }
    }

    pub fn with_dates(mut self, start: Date, end: Date) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn with_parameters(mut self, parameters: ParameterOverrides) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Runs every plan in order without a control socket.
pub struct AutomatedSession {
    ctx: SessionContext,
    plans: Vec<ExecutionPlan>,
    stop: CancellationToken,
}

impl AutomatedSession {
    pub(super) fn new(ctx: SessionContext, plans: Vec<ExecutionPlan>) -> Self {
        Self {
            ctx,
            plans,
            stop: CancellationToken::new(),
        }
    }

    /// Cancelling the token fails the running execution and skips the rest.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Ports the workers must dial: broker first, namespace second.
    pub fn pool_ports(&self) -> (u16, u16) {
        self.ctx.pool.configure()
    }

    /// Returns the ids of every execution created. A failed execution does not stop the ones
    /// after it, the first failure is returned once all have run.
    pub async fn run(mut self) -> Result<Vec<ExecutionId>, SessionError> {
        let plans = std::mem::take(&mut self.plans);
        let mut ids = Vec::with_capacity(plans.len());
        let mut first_error = None;

        for plan in plans {
            if self.stop.is_cancelled() {
                info!("SESSION: Stop requested, skipping remaining executions");
                break;
            }
            let record = match self.create(&plan).await {
                Ok(record) => record,
                Err(e) => {
                    warn!("SESSION: {}", e);
                    first_error.get_or_insert(e);
                    continue;
                }
            };
            ids.push(record.id);
            if let Err(e) = self.execute(plan, &record).await {
                warn!("SESSION: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.ctx.pool.close()?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(ids),
        }
    }

    async fn create(&self, plan: &ExecutionPlan) -> Result<ExecutionRecord, SessionError> {
        let backtest = &self.ctx.backtest;
        self.ctx
            .executions
            .create(NewExecution {
                session_id: self.ctx.session_id,
                start: plan.start.unwrap_or(backtest.start),
                end: plan.end.unwrap_or(backtest.end),
                frequency: backtest.frequency,
                symbols: plan.symbols.clone().unwrap_or_else(|| backtest.symbols.clone()),
                benchmark: plan.benchmark.clone().unwrap_or_else(|| backtest.benchmark.clone()),
            })
            .await
            .map_err(|e| SessionError::Repository {
                reason: format!("{e:#}"),
            })
    }

    async fn execute(&self, plan: ExecutionPlan, record: &ExecutionRecord) -> Result<(), SessionError> {
        let failed = |reason: String| SessionError::Execution {
            id: record.id,
            reason,
        };

        self.ctx.pool.set_algorithm(plan.algorithm);
        let params = execution::params(record, self.ctx.backtest.initial_cash);
        let prepared = async {
            self.ctx.pool.resolve_parameters(&plan.parameters)?;
            self.ctx.engine.configure(&params).await?;
            self.ctx
                .executions
                .update_simulation_details(record.id, execution::details(record, ExecutionStatus::Running))
                .await
        };

        let result = match prepared.await {
            Ok(()) => {
                info!("SESSION: Running execution {}", record.id);
                let (snapshots, _) = watch::channel(None);
                execution::run_to_completion(
                    self.ctx.engine.as_ref(),
                    &self.ctx.pool,
                    &params,
                    self.stop.child_token(),
                    &snapshots,
                )
                .await
            }
            Err(e) => Err(e),
        };

        let reason = result.as_ref().err().map(|e| format!("{e:#}"));
        let status = execution::conclude(&self.ctx, record, &result)
            .await
            .map_err(|e| SessionError::Repository {
                reason: format!("{e:#}"),
            })?;
        match (status, reason) {
            (ExecutionStatus::Finished, _) => Ok(()),
            (_, reason) => Err(failed(reason.unwrap_or_default())),
        }
    }
}
