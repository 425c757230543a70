use anyhow::Result;
use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{BacktestParams, Engine};
use crate::pool::WorkerPool;
use crate::repository::{ExecutionRecord, ExecutionStatus, SimulationDetails};
use crate::types::{ExecutionId, Period, Portfolio};

use super::SessionContext;

/// Sent by a run task to the control loop once the engine returns.
pub(crate) struct RunOutcome {
    pub(crate) execution_id: ExecutionId,
    pub(crate) result: Result<Vec<Period>>,
}

/// The active execution of a manual session. Snapshots and the task only exist while running.
pub(crate) struct Execution {
    pub(crate) record: ExecutionRecord,
    pub(crate) cancel: CancellationToken,
    pub(crate) snapshots: Option<watch::Receiver<Option<Portfolio>>>,
    pub(crate) task: Option<JoinHandle<()>>,
}

impl Execution {
    pub(crate) fn new(record: ExecutionRecord, cancel: CancellationToken) -> Self {
        Self {
            record,
            cancel,
            snapshots: None,
            task: None,
        }
    }

    pub(crate) fn id(&self) -> ExecutionId {
        self.record.id
    }

    /// Latest portfolio sent by the run task.
    pub(crate) fn portfolio(&self) -> Option<Portfolio> {
        self.snapshots
            .as_ref()
            .and_then(|snapshots| snapshots.borrow().clone())
    }
}

pub(crate) fn params(record: &ExecutionRecord, initial_cash: f64) -> BacktestParams {
    BacktestParams {
        execution_id: record.id,
        start: record.start,
        end: record.end,
        symbols: record.symbols.clone(),
        benchmark: record.benchmark.clone(),
        frequency: record.frequency,
        initial_cash,
    }
}

pub(crate) fn details(record: &ExecutionRecord, status: ExecutionStatus) -> SimulationDetails {
    SimulationDetails {
        status,
        start: record.start,
        end: record.end,
        symbols: record.symbols.clone(),
        benchmark: record.benchmark.clone(),
    }
}

/// Runs the engine to the last date and collects its periods.
pub(crate) async fn run_to_completion(
    engine: &dyn Engine,
    pool: &WorkerPool,
    params: &BacktestParams,
    cancel: CancellationToken,
    snapshots: &watch::Sender<Option<Portfolio>>,
) -> Result<Vec<Period>> {
    engine.run_backtest(cancel, params, pool, snapshots).await?;
    engine.get_result(params.execution_id).await
}

/// Persists the periods of a finished run and records how it ended.
pub(crate) async fn conclude(
    ctx: &SessionContext,
    record: &ExecutionRecord,
    result: &Result<Vec<Period>>,
) -> Result<ExecutionStatus> {
    let status = match result {
        Ok(periods) => {
            ctx.periods.store(periods).await?;
            info!(
                "SESSION: Execution {} finished with {} periods",
                record.id,
                periods.len()
            );
            ExecutionStatus::Finished
        }
        Err(e) => {
            warn!("SESSION: Execution {} failed: {:#}", record.id, e);
            ExecutionStatus::Failed
        }
    };
    ctx.executions
        .update_simulation_details(record.id, details(record, status))
        .await?;
    Ok(status)
}
