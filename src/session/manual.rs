use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::repository::{ExecutionStatus, NewExecution};
use crate::socket::{ignore_closed, ReplyHandle, Replier, SocketError};
use crate::wire::Envelope;

use super::command::{
    date_or, Command, CommandError, ConfigureExecutionReply, ConfigureExecutionRequest, ControlReply,
    NewExecutionReply, NewExecutionRequest, PortfolioReply, Reply, RunExecutionReply,
};
use super::execution::{self, Execution, RunOutcome};
use super::{SessionContext, SessionError, SessionState};

const OUTCOME_BACKLOG: usize = 4;

enum Event {
    Stop,
    Finished(RunOutcome),
    Received(Result<(Envelope, ReplyHandle), SocketError>),
}

/// A session controlled over its control socket, see [run](ManualSession::run).
pub struct ManualSession {
    ctx: SessionContext,
    control: Replier,
    state: SessionState,
    execution: Option<Execution>,
    outcomes_tx: mpsc::Sender<RunOutcome>,
    outcomes_rx: mpsc::Receiver<RunOutcome>,
    stop: CancellationToken,
}

impl ManualSession {
    pub(super) fn new(ctx: SessionContext, control: Replier) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::channel(OUTCOME_BACKLOG);
        Self {
            ctx,
            control,
            state: SessionState::Idle,
            execution: None,
            outcomes_tx,
            outcomes_rx,
            stop: CancellationToken::new(),
        }
    }

    pub fn host(&self) -> &str {
        self.control.host()
    }

    /// Port the control socket listens on.
    pub fn port(&self) -> u16 {
        self.control.port()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Cancelling the token stops the session from outside the control protocol.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Serves commands until `stop`, the stop token or a fatal error, then tears the session
    /// down. Teardown runs whichever way the loop ended.
    pub async fn run(mut self) -> Result<(), SessionError> {
        info!("SESSION: {} listening on {}", self.ctx.session_id, self.port());
        let served = self.serve().await;
        let torn_down = self.teardown().await;
        served.and(torn_down)
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        let poll = self.ctx.config.poll_timeout;
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Event::Stop,
                Some(outcome) = self.outcomes_rx.recv() => Event::Finished(outcome),
                received = self.control.receive_timeout::<Envelope>(poll) => Event::Received(received),
            };

            match event {
                Event::Stop => {
                    info!("SESSION: Stop requested");
                    return Ok(());
                }
                Event::Finished(outcome) => self.finish(outcome).await,
                Event::Received(Ok((envelope, handle))) => {
                    if self.handle(envelope, handle).await? {
                        return Ok(());
                    }
                }
                Event::Received(Err(SocketError::Timeout)) => continue,
                Event::Received(Err(SocketError::Closed)) => {
                    debug!("SESSION: Control socket closed");
                    return Ok(());
                }
                Event::Received(Err(SocketError::Malformed { source, handle })) => {
                    let error = CommandError::MalformedRequest { source };
                    warn!("SESSION: {}", error);
                    let reply = ControlReply::new("", &Err(error));
                    handle
                        .reply(&reply)
                        .await
                        .map_err(|source| SessionError::Reply {
                            task: String::new(),
                            source,
                        })?;
                }
                Event::Received(Err(e)) => warn!("SESSION: Receive failed: {}", e),
            }
        }
    }

    /// Runs one command and replies to it. Returns true when the loop should exit.
    async fn handle(&mut self, envelope: Envelope, handle: ReplyHandle) -> Result<bool, SessionError> {
        let task = envelope.task.clone();
        let command = Command::parse(&envelope);
        let stopping = matches!(command, Ok(Command::Stop));

        let result = match command {
            Ok(command) => self.dispatch(command).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            warn!("SESSION: {} failed: {}", task, e);
        }

        let reply = ControlReply::new(task.as_str(), &result);
        handle
            .reply(&reply)
            .await
            .map_err(|source| SessionError::Reply {
                task: task.clone(),
                source,
            })?;

        match result {
            Err(CommandError::EngineConfigure { reason }) => Err(SessionError::EngineConfigure { reason }),
            _ => Ok(stopping),
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<Reply, CommandError> {
        match command {
            Command::NewExecution(req) => self.new_execution(req).await,
            Command::ConfigureExecution(req) => self.configure_execution(req).await,
            Command::RunExecution => self.run_execution().await,
            Command::CurrentPortfolio => Ok(Reply::Portfolio(PortfolioReply {
                portfolio: self.execution.as_ref().and_then(Execution::portfolio),
            })),
            Command::Stop => Ok(Reply::Stopped),
            Command::Unknown(task) => Err(CommandError::UnknownTask { task }),
        }
    }

    async fn new_execution(&mut self, req: NewExecutionRequest) -> Result<Reply, CommandError> {
        if let Some(execution) = &self.execution {
            return Err(CommandError::ExecutionActive { id: execution.id() });
        }

        let backtest = &self.ctx.backtest;
        let start = date_or(req.start.as_deref(), backtest.start)?;
        let end = date_or(req.end.as_deref(), backtest.end)?;
        if start > end {
            return Err(CommandError::InvalidRange { start, end });
        }

        let record = self
            .ctx
            .executions
            .create(NewExecution {
                session_id: self.ctx.session_id,
                start,
                end,
                frequency: backtest.frequency,
                symbols: req.symbols.unwrap_or_else(|| backtest.symbols.clone()),
                benchmark: req.benchmark.unwrap_or_else(|| backtest.benchmark.clone()),
            })
            .await
            .map_err(|e| CommandError::Repository {
                reason: e.to_string(),
            })?;
        self.ctx.pool.set_algorithm(req.algorithm);

        info!("SESSION: Created execution {}", record.id);
        let reply = NewExecutionReply {
            execution_id: record.id,
            start: record.start.to_string(),
            end: record.end.to_string(),
            symbols: record.symbols.clone(),
        };
        self.execution = Some(Execution::new(record, self.stop.child_token()));
        self.state = SessionState::Configuring;
        Ok(Reply::NewExecution(reply))
    }

    async fn configure_execution(&mut self, req: ConfigureExecutionRequest) -> Result<Reply, CommandError> {
        if !matches!(self.state, SessionState::Configuring | SessionState::Configured) {
            return Err(self.invalid_state(super::command::CONFIGURE_EXECUTION));
        }
        let execution = self.execution.as_mut().ok_or(CommandError::NoExecution)?;

        let mut record = execution.record.clone();
        record.start = date_or(req.start.as_deref(), record.start)?;
        record.end = date_or(req.end.as_deref(), record.end)?;
        if record.start > record.end {
            return Err(CommandError::InvalidRange {
                start: record.start,
                end: record.end,
            });
        }
        if let Some(symbols) = req.symbols {
            record.symbols = symbols;
        }
        if let Some(benchmark) = req.benchmark {
            record.benchmark = benchmark;
        }

        let functions = self.ctx.pool.resolve_parameters(&req.parameters)?;
        record.status = ExecutionStatus::Configured;
        self.ctx
            .executions
            .update_simulation_details(record.id, execution::details(&record, record.status))
            .await
            .map_err(|e| CommandError::Repository {
                reason: e.to_string(),
            })?;

        let (broker_port, namespace_port) = self.ctx.pool.configure();
        let reply = ConfigureExecutionReply {
            execution_id: record.id,
            broker_port,
            namespace_port,
            database_url: self.ctx.config.database_url.clone(),
            functions,
        };
        execution.record = record;
        self.state = SessionState::Configured;
        Ok(Reply::ConfigureExecution(reply))
    }

    async fn run_execution(&mut self) -> Result<Reply, CommandError> {
        if self.state != SessionState::Configured {
            return Err(self.invalid_state(super::command::RUN_EXECUTION));
        }
        let execution = self.execution.as_mut().ok_or(CommandError::NoExecution)?;
        let params = execution::params(&execution.record, self.ctx.backtest.initial_cash);

        self.ctx
            .engine
            .configure(&params)
            .await
            .map_err(|e| CommandError::EngineConfigure {
                reason: format!("{e:#}"),
            })?;
        execution.record.status = ExecutionStatus::Running;
        self.ctx
            .executions
            .update_simulation_details(
                execution.id(),
                execution::details(&execution.record, ExecutionStatus::Running),
            )
            .await
            .map_err(|e| CommandError::Repository {
                reason: e.to_string(),
            })?;

        let (snapshots_tx, snapshots_rx) = watch::channel(None);
        let engine = Arc::clone(&self.ctx.engine);
        let pool = Arc::clone(&self.ctx.pool);
        let outcomes = self.outcomes_tx.clone();
        let cancel = execution.cancel.clone();
        let execution_id = execution.id();

        let task = tokio::spawn(async move {
            let result = execution::run_to_completion(engine.as_ref(), &pool, &params, cancel, &snapshots_tx).await;
            if outcomes.send(RunOutcome { execution_id, result }).await.is_err() {
                debug!("SESSION: Outcome of {} dropped, session is gone", execution_id);
            }
        });

        execution.snapshots = Some(snapshots_rx);
        execution.task = Some(task);
        self.state = SessionState::Running;
        info!("SESSION: Running execution {}", execution_id);
        Ok(Reply::RunExecution(RunExecutionReply { execution_id }))
    }

    fn invalid_state(&self, task: &str) -> CommandError {
        CommandError::InvalidState {
            task: task.to_string(),
            state: self.state,
        }
    }

    /// Persists the outcome of the active execution and returns the session to idle.
    async fn finish(&mut self, outcome: RunOutcome) {
        let active = self.execution.as_ref().map(Execution::id);
        if active != Some(outcome.execution_id) {
            warn!("SESSION: Outcome for unknown execution {}", outcome.execution_id);
            return;
        }
        let Some(execution) = self.execution.take() else {
            return;
        };
        if let Err(e) = execution::conclude(&self.ctx, &execution.record, &outcome.result).await {
            error!("SESSION: Failed to persist execution {}: {:#}", execution.id(), e);
        }
        if self.state != SessionState::Stopped {
            self.state = SessionState::Idle;
        }
    }

    async fn teardown(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::Stopped;

        if let Some(mut execution) = self.execution.take() {
            execution.cancel.cancel();
            if let Some(task) = execution.task.take() {
                if let Err(e) = task.await {
                    error!("SESSION: Run task of {} panicked: {}", execution.id(), e);
                }
                //The run task has sent its outcome before exiting
                let execution_id = execution.id();
                self.execution = Some(execution);
                match self.outcomes_rx.try_recv() {
                    Ok(outcome) => self.finish(outcome).await,
                    Err(_) => debug!("SESSION: No outcome for {}", execution_id),
                }
            } else {
                //Never started, so no run task will record how it ended
                info!("SESSION: Execution {} abandoned before running", execution.id());
                let details = execution::details(&execution.record, ExecutionStatus::Failed);
                if let Err(e) = self.ctx.executions.update_simulation_details(execution.id(), details).await {
                    error!("SESSION: Failed to persist execution {}: {:#}", execution.id(), e);
                }
            }
        }

        if let Err(e) = self.ctx.engine.stop().await {
            error!("SESSION: Engine failed to stop: {:#}", e);
        }
        ignore_closed(self.control.close())?;
        self.ctx.pool.close()?;
        info!("SESSION: {} stopped", self.ctx.session_id);
        Ok(())
    }
}
